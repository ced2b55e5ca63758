//! Tests for the L2CAP channel layer

#[cfg(test)]
mod tests {
    use super::super::constants::*;
    use super::super::*;
    use crate::error::HostError;
    use crate::host::sim::{SimConfig, SimHost, SimLink};
    use crate::host::{ConnHandle, GapLink, HostStack};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard};
    use std::thread;
    use std::time::Duration;

    const TEST_PSM: Psm = Psm::new(0x0081);

    fn init() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[derive(Default)]
    struct Record {
        connects: Vec<u16>,
        reads: Vec<Vec<u8>>,
        disconnects: usize,
        mtu_changes: Vec<u16>,
        accept_queries: usize,
    }

    impl Record {
        fn received(&self) -> Vec<u8> {
            self.reads.concat()
        }
    }

    /// Shared view of what an endpoint's callbacks saw
    #[derive(Clone, Default)]
    struct Watch {
        record: Arc<Mutex<Record>>,
        refuse: Arc<AtomicBool>,
        drops: Arc<AtomicUsize>,
        echo: bool,
    }

    impl Watch {
        fn echoing() -> Self {
            Self {
                echo: true,
                ..Default::default()
            }
        }

        fn callbacks(&self) -> Box<Recorder> {
            Box::new(Recorder(self.clone()))
        }

        fn record(&self) -> MutexGuard<'_, Record> {
            self.record.lock().unwrap()
        }
    }

    struct Recorder(Watch);

    impl<R: Role> CocCallbacks<R> for Recorder {
        fn on_connect(&mut self, _coc: &Coc<R>, negotiated_mtu: u16) {
            self.0.record().connects.push(negotiated_mtu);
        }

        fn on_read(&mut self, coc: &Coc<R>, data: &[u8]) {
            assert!(data.len() <= coc.mtu() as usize);
            self.0.record().reads.push(data.to_vec());
            if self.0.echo {
                coc.write(data).unwrap();
            }
        }

        fn on_disconnect(&mut self, _coc: &Coc<R>) {
            self.0.record().disconnects += 1;
        }
    }

    impl ClientCallbacks for Recorder {
        fn on_mtu_change(&mut self, _client: &L2capClient, mtu: u16) {
            self.0.record().mtu_changes.push(mtu);
        }
    }

    impl ServiceCallbacks for Recorder {
        fn should_accept_connection(&mut self, _service: &L2capService) -> bool {
            self.0.record().accept_queries += 1;
            !self.0.refuse.load(Ordering::SeqCst)
        }
    }

    impl Drop for Recorder {
        fn drop(&mut self) {
            self.0.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        sim: Arc<SimHost>,
        host: Arc<dyn HostStack>,
        link: SimLink,
        server: L2capServer,
        config: CocConfig,
    }

    impl Harness {
        fn new(sim_config: SimConfig, config: CocConfig) -> Self {
            init();
            let sim = Arc::new(SimHost::new(sim_config));
            let host: Arc<dyn HostStack> = sim.clone();
            let link = sim.establish_link();
            let server = L2capServer::with_config(host.clone(), config);
            Self {
                sim,
                host,
                link,
                server,
                config,
            }
        }

        fn with_window(tx_window: usize) -> Self {
            Self::new(SimConfig { tx_window }, CocConfig::default())
        }

        fn serve(&mut self, psm: Psm, mtu: u16, watch: &Watch) {
            self.server
                .create_service(psm, mtu, watch.callbacks())
                .unwrap();
        }

        fn client(&self, psm: Psm, mtu: u16, watch: &Watch) -> L2capClient {
            L2capClient::create_client_with_config(
                self.host.clone(),
                psm,
                mtu,
                watch.callbacks(),
                self.config,
            )
        }

        /// Serve `TEST_PSM` and connect a client to it
        fn connected_pair(
            &mut self,
            server_mtu: u16,
            client_mtu: u16,
        ) -> (L2capClient, Watch, Watch) {
            let service_watch = Watch::default();
            let client_watch = Watch::default();
            self.serve(TEST_PSM, server_mtu, &service_watch);
            let client = self.client(TEST_PSM, client_mtu, &client_watch);
            client.connect(&self.link).unwrap();
            self.sim.run_until_idle();
            assert!(client.is_connected());
            (client, service_watch, client_watch)
        }

        fn service(&self) -> &L2capService {
            self.server.service(TEST_PSM).unwrap()
        }

        /// Write from a separate thread while this thread drives the host
        fn write_pumped<R: Role>(&self, coc: &Coc<R>, data: &[u8]) -> L2capResult<()> {
            thread::scope(|s| {
                let writer = s.spawn(|| coc.write(data));
                while !writer.is_finished() {
                    self.sim.run_until_idle();
                    thread::yield_now();
                }
                self.sim.run_until_idle();
                writer.join().unwrap()
            })
        }

        fn accepted_sends(&self) -> Vec<usize> {
            self.sim
                .send_log()
                .iter()
                .filter(|r| r.accepted)
                .map(|r| r.len)
                .collect()
        }
    }

    #[test]
    fn test_pool_sizing() {
        let config = CocConfig::default();
        assert_eq!(config.pool_blocks(5000), Some(60));
        assert_eq!(config.pool_blocks(250), Some(3));
        assert_eq!(config.pool_blocks(251), Some(6));
        assert_eq!(config.pool_blocks(23), Some(3));
        assert!(config.validate().is_ok());

        let pool = BufferPool::for_mtu(5000, &config).unwrap();
        assert_eq!(pool.capacity(), 60);
        assert_eq!(pool.available(), 60);
        assert_eq!(pool.block_size(), L2CAP_COC_BLOCK_SIZE);
    }

    #[test]
    fn test_sdu_buffer_returns_blocks_on_drop() {
        let pool = BufferPool::with_blocks(4, 16).unwrap();

        let data: Vec<u8> = (0..40).collect();
        let sdu = pool.acquire_with(&data).unwrap();
        assert_eq!(sdu.len(), 40);
        assert_eq!(pool.available(), 1);
        assert_eq!(sdu.to_vec(), data);

        let mut out = [0u8; 40];
        assert_eq!(sdu.copy_to(&mut out), 40);
        assert_eq!(&out[..], &data[..]);

        drop(sdu);
        assert_eq!(pool.available(), 4);

        // Too large for the whole pool; nothing leaks
        assert!(matches!(
            pool.acquire_with(&[0u8; 100]),
            Err(L2capError::ResourceLimitReached)
        ));
        assert_eq!(pool.available(), 4);

        assert!(BufferPool::with_blocks(1, 0).is_err());
    }

    #[test]
    fn test_psm_ranges() {
        assert!(!Psm::new(0x0000).is_valid());
        assert!(!Psm::new(0x0100).is_valid());
        assert!(Psm::OTS.is_valid());
        assert!(Psm::OTS.is_fixed());
        assert!(!Psm::OTS.is_dynamic());
        assert!(TEST_PSM.is_dynamic());

        assert_eq!(Psm::from(0x0025), Psm::OTS);
        assert_eq!(Psm::OTS.to_string(), "OTS (0x0025)");
        assert_eq!(Psm::new(0x0081).to_string(), "0x0081");
    }

    #[test]
    fn test_dynamic_psm_allocation() {
        let psm1 = obtain_dynamic_psm();
        let psm2 = obtain_dynamic_psm();

        assert_ne!(psm1, psm2);
        assert!(psm1.is_dynamic());
        assert!(psm2.is_dynamic());
    }

    #[test]
    fn test_connect_reports_peer_mtu() {
        let mut h = Harness::with_window(8);
        let (client, service_watch, client_watch) = h.connected_pair(300, 200);

        assert_eq!(client.state(), CocState::Connected);
        assert_eq!(client.peer_mtu(), Some(300));
        assert_eq!(h.service().state(), CocState::Connected);
        assert_eq!(h.service().peer_mtu(), Some(200));
        assert_eq!(client_watch.record().connects, vec![300]);
        assert_eq!(service_watch.record().connects, vec![200]);
        assert_eq!(service_watch.record().accept_queries, 1);
    }

    #[test]
    fn test_random_payloads_reassemble() {
        let mut h = Harness::with_window(64);
        let (client, service_watch, _) = h.connected_pair(300, 200);
        let mut rng = StdRng::seed_from_u64(0x0c0c);

        let mut expected = Vec::new();
        for _ in 0..20 {
            let mut payload = vec![0u8; rng.gen_range(1..=2000)];
            rng.fill(&mut payload[..]);
            client.write(&payload).unwrap();
            h.sim.run_until_idle();
            expected.extend_from_slice(&payload);
        }

        let record = service_watch.record();
        assert_eq!(record.received(), expected);
        assert!(record.reads.iter().all(|r| !r.is_empty() && r.len() <= 200));
    }

    #[test]
    fn test_segments_never_exceed_mtu() {
        let mut h = Harness::with_window(16);
        let (client, service_watch, _) = h.connected_pair(500, 500);

        client.write(&[0x5a; 5000]).unwrap();
        h.sim.run_until_idle();

        assert_eq!(h.accepted_sends(), vec![500; 10]);
        let record = service_watch.record();
        assert_eq!(record.reads.len(), 10);
        assert_eq!(record.received(), vec![0x5a; 5000]);
    }

    #[test]
    fn test_empty_write_submits_nothing() {
        let mut h = Harness::with_window(8);
        let (client, _, _) = h.connected_pair(200, 200);

        client.write(&[]).unwrap();
        assert!(h.sim.send_log().is_empty());
    }

    #[test]
    fn test_segment_size_follows_smaller_mtu() {
        let mut h = Harness::with_window(16);
        let (client, _, _) = h.connected_pair(100, 500);

        client.write(&[1; 350]).unwrap();
        h.sim.run_until_idle();
        assert_eq!(h.accepted_sends(), vec![100, 100, 100, 50]);

        // The service writes back with its own, smaller MTU as the cap
        h.service().write(&[2; 350]).unwrap();
        h.sim.run_until_idle();
        assert_eq!(
            h.accepted_sends()[4..],
            [100, 100, 100, 50]
        );
    }

    #[test]
    fn test_write_on_closed_channel_fails_fast() {
        let mut h = Harness::with_window(8);
        let (client, service_watch, client_watch) = h.connected_pair(200, 200);

        client.disconnect().unwrap();
        h.sim.run_until_idle();
        assert_eq!(client.state(), CocState::Disconnected);
        assert_eq!(client.peer_mtu(), None);
        assert_eq!(client_watch.record().disconnects, 1);
        assert_eq!(service_watch.record().disconnects, 1);

        assert!(matches!(client.write(b"late"), Err(L2capError::NotConnected)));
        assert!(matches!(client.disconnect(), Err(L2capError::NotConnected)));
        assert!(h.sim.send_log().is_empty());
    }

    #[test]
    fn test_receive_buffer_reposted_after_each_sdu() {
        let mut h = Harness::with_window(16);
        let (client, _, _) = h.connected_pair(500, 500);

        for _ in 0..5 {
            client.write(&[7; 1200]).unwrap();
            h.sim.run_until_idle();
        }

        assert_eq!(h.sim.rx_gaps(), 0);
        for chan in h.sim.open_channels() {
            assert!(h.sim.has_rx_buffer(chan));
        }
        // One block stays posted with the host on each side
        let pool = h.service().buffer_pool().unwrap();
        assert_eq!(pool.available(), pool.capacity() - 1);
        let pool = client.buffer_pool().unwrap();
        assert_eq!(pool.available(), pool.capacity() - 1);
    }

    #[test]
    fn test_stalled_segment_is_retried_alone() {
        let config = CocConfig {
            stall_retry_interval: Duration::from_millis(1),
            ..CocConfig::default()
        };
        let mut h = Harness::new(SimConfig { tx_window: 16 }, config);
        let (client, service_watch, _) = h.connected_pair(500, 500);

        // Segment 3 is refused three times
        h.sim.stall_sends_after(2, 3);
        let payload: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        client.write(&payload).unwrap();

        let log = h.sim.send_log();
        let accepted: Vec<bool> = log.iter().map(|r| r.accepted).collect();
        let mut expected = vec![true, true, false, false, false];
        expected.extend([true; 8]);
        assert_eq!(accepted, expected);
        assert!(log.iter().all(|r| r.len == 500));
        assert_eq!(h.accepted_sends(), vec![500; 10]);

        h.sim.run_until_idle();
        assert_eq!(service_watch.record().received(), payload);
    }

    #[test]
    fn test_stall_without_unstall_retries_after_interval() {
        let config = CocConfig {
            stall_retry_interval: Duration::from_millis(1),
            ..CocConfig::default()
        };
        let mut h = Harness::new(SimConfig { tx_window: 16 }, config);
        let (client, _, _) = h.connected_pair(200, 200);

        // Nothing is in flight, so no unstall event will come
        h.sim.stall_next_sends(2);
        client.write(&[4; 300]).unwrap();

        let accepted: Vec<bool> = h.sim.send_log().iter().map(|r| r.accepted).collect();
        assert_eq!(accepted, vec![false, false, true, true]);
        assert_eq!(h.accepted_sends(), vec![200, 100]);
    }

    #[test]
    fn test_hard_send_error_reports_progress() {
        let mut h = Harness::with_window(16);
        let (client, _, _) = h.connected_pair(500, 500);

        client.write(&[0; 500]).unwrap();
        h.sim.fail_next_send(HostError::NoMemory);
        match client.write(&[0; 1000]) {
            Err(L2capError::SendFailed { sent, source }) => {
                assert_eq!(sent, 0);
                assert_eq!(source, HostError::NoMemory);
            }
            other => panic!("unexpected write result: {:?}", other),
        }
        // The channel stays usable
        client.write(&[0; 1000]).unwrap();
    }

    #[test]
    fn test_disconnect_during_blocked_write() {
        let mut h = Harness::with_window(2);
        let (client, _, _) = h.connected_pair(500, 500);

        let result = thread::scope(|s| {
            let writer = s.spawn(|| client.write(&[9; 2000]));
            while !h.sim.send_log().iter().any(|r| !r.accepted) {
                thread::sleep(Duration::from_millis(1));
            }
            client.disconnect().unwrap();
            h.sim.run_until_idle();
            writer.join().unwrap()
        });

        match result {
            Err(L2capError::SendFailed { sent, source }) => {
                assert_eq!(sent, 1000);
                assert_eq!(source, HostError::NotConnected);
            }
            other => panic!("unexpected write result: {:?}", other),
        }
        assert_eq!(client.state(), CocState::Disconnected);
    }

    #[test]
    fn test_backpressure_with_host_pump() {
        let mut h = Harness::with_window(2);
        let (client, service_watch, _) = h.connected_pair(100, 100);

        let mut rng = StdRng::seed_from_u64(42);
        let mut payload = vec![0u8; 5000];
        rng.fill(&mut payload[..]);

        h.write_pumped(&client, &payload).unwrap();

        assert_eq!(h.accepted_sends(), vec![100; 50]);
        assert_eq!(service_watch.record().received(), payload);
        assert_eq!(h.sim.rx_gaps(), 0);
    }

    #[test]
    fn test_rejected_connection_leaves_service_untouched() {
        let mut h = Harness::with_window(8);
        let service_watch = Watch::default();
        service_watch.refuse.store(true, Ordering::SeqCst);
        h.serve(TEST_PSM, 500, &service_watch);

        let client_watch = Watch::default();
        let client = h.client(TEST_PSM, 500, &client_watch);
        client.connect(&h.link).unwrap();
        h.sim.run_until_idle();

        assert_eq!(client.state(), CocState::Idle);
        assert_eq!(h.service().state(), CocState::Idle);
        assert!(client_watch.record().connects.is_empty());
        assert!(service_watch.record().connects.is_empty());
        assert_eq!(service_watch.record().accept_queries, 1);
        let pool = h.service().buffer_pool().unwrap();
        assert_eq!(pool.available(), pool.capacity());

        // The next attempt is accepted
        service_watch.refuse.store(false, Ordering::SeqCst);
        client.connect(&h.link).unwrap();
        h.sim.run_until_idle();
        assert!(client.is_connected());
        assert!(h.service().is_connected());
        assert_eq!(service_watch.record().accept_queries, 2);
        assert_eq!(service_watch.record().connects, vec![500]);
    }

    #[test]
    fn test_busy_service_refuses_second_peer() {
        let mut h = Harness::with_window(8);
        let (first, _, _) = h.connected_pair(200, 200);

        let second = h.client(TEST_PSM, 200, &Watch::default());
        second.connect(&h.link).unwrap();
        h.sim.run_until_idle();

        assert_eq!(second.state(), CocState::Idle);
        assert!(first.is_connected());
        assert!(h.service().is_connected());
    }

    #[test]
    fn test_service_accepts_again_after_peer_leaves() {
        let mut h = Harness::with_window(8);
        let (client, service_watch, _) = h.connected_pair(200, 200);

        drop(client);
        h.sim.run_until_idle();
        assert_eq!(h.service().state(), CocState::Disconnected);
        assert_eq!(service_watch.record().disconnects, 1);

        let next = h.client(TEST_PSM, 200, &Watch::default());
        next.connect(&h.link).unwrap();
        h.sim.run_until_idle();
        assert!(next.is_connected());
        assert_eq!(service_watch.record().connects.len(), 2);
    }

    #[test]
    fn test_server_teardown_drops_each_service_once() {
        let mut h = Harness::with_window(8);
        let first = Watch::default();
        let second = Watch::default();
        h.serve(Psm::new(0x0090), 200, &first);
        h.serve(Psm::new(0x0091), 200, &second);
        assert_eq!(h.server.len(), 2);

        let client_watch = Watch::default();
        let client = h.client(Psm::new(0x0090), 200, &client_watch);
        client.connect(&h.link).unwrap();
        h.sim.run_until_idle();
        assert!(client.is_connected());

        let server = std::mem::replace(&mut h.server, L2capServer::new(h.host.clone()));
        drop(server);
        assert_eq!(first.drops.load(Ordering::SeqCst), 1);
        assert_eq!(second.drops.load(Ordering::SeqCst), 1);

        // The open channel is closed from the service side
        h.sim.run_until_idle();
        assert_eq!(client.state(), CocState::Disconnected);
        assert_eq!(client_watch.record().disconnects, 1);

        // Listeners of a freed service refuse new peers
        let late = h.client(Psm::new(0x0091), 200, &Watch::default());
        late.connect(&h.link).unwrap();
        h.sim.run_until_idle();
        assert_eq!(late.state(), CocState::Idle);
        assert_eq!(second.record().accept_queries, 0);

        // The host still holds the old listener; nothing gets registered
        assert!(matches!(
            h.server.create_service(Psm::new(0x0091), 200, Watch::default().callbacks()),
            Err(L2capError::Host(HostError::AlreadyRegistered))
        ));
        assert!(h.server.is_empty());
    }

    #[test]
    fn test_create_service_rejects_bad_psm() {
        let mut h = Harness::with_window(8);
        let watch = Watch::default();

        assert!(matches!(
            h.server.create_service(Psm::new(0x0000), 200, watch.callbacks()),
            Err(L2capError::InvalidParameter(_))
        ));
        assert!(matches!(
            h.server.create_service(Psm::new(0x0100), 200, watch.callbacks()),
            Err(L2capError::InvalidParameter(_))
        ));

        h.serve(TEST_PSM, 200, &watch);
        assert!(matches!(
            h.server.create_service(TEST_PSM, 300, watch.callbacks()),
            Err(L2capError::InvalidParameter(_))
        ));
        assert_eq!(h.server.len(), 1);
        assert_eq!(h.service().mtu(), 200);
    }

    #[test]
    fn test_client_hears_mtu_change() {
        let mut h = Harness::with_window(8);
        let (client, _, client_watch) = h.connected_pair(200, 500);

        // The initiator's channel is allocated first
        let chans = h.sim.open_channels();
        assert_eq!(chans.len(), 2);
        h.sim.reconfigure(chans[1], 1000).unwrap();
        h.sim.run_until_idle();

        assert_eq!(client_watch.record().mtu_changes, vec![1000]);
        assert_eq!(client.peer_mtu(), Some(1000));

        // Still capped by our own MTU
        client.write(&[3; 1000]).unwrap();
        assert_eq!(h.accepted_sends(), vec![500, 500]);
    }

    #[test]
    fn test_client_reconnects() {
        let mut h = Harness::with_window(8);
        let (client, _, client_watch) = h.connected_pair(200, 200);

        assert!(matches!(client.connect(&h.link), Err(L2capError::InvalidState)));

        client.disconnect().unwrap();
        h.sim.run_until_idle();
        client.connect(&h.link).unwrap();
        h.sim.run_until_idle();

        assert!(client.is_connected());
        assert_eq!(client_watch.record().connects, vec![200, 200]);
        assert_eq!(client_watch.record().disconnects, 1);
    }

    #[test]
    fn test_connect_failures_return_to_idle() {
        let h = Harness::with_window(8);
        let client_watch = Watch::default();

        // Nobody listens on the PSM
        let client = h.client(Psm::new(0x00A0), 200, &client_watch);
        client.connect(&h.link).unwrap();
        assert_eq!(client.state(), CocState::Connecting);
        h.sim.run_until_idle();
        assert_eq!(client.state(), CocState::Idle);
        assert!(client_watch.record().connects.is_empty());
        let pool = client.buffer_pool().unwrap();
        assert_eq!(pool.available(), pool.capacity());

        // No GAP link
        let down = SimLink::down(ConnHandle(0x0042));
        assert!(matches!(client.connect(&down), Err(L2capError::NotConnected)));

        // Link torn down underneath
        h.sim.terminate_link(h.link.conn_handle());
        assert!(!h.link.is_connected());
        assert!(matches!(client.connect(&h.link), Err(L2capError::NotConnected)));
        assert_eq!(client.state(), CocState::Idle);
    }

    #[test]
    fn test_link_loss_while_connecting_allows_reconnect() {
        let mut h = Harness::with_window(8);
        let service_watch = Watch::default();
        h.serve(TEST_PSM, 200, &service_watch);

        let client_watch = Watch::default();
        let client = h.client(TEST_PSM, 200, &client_watch);
        client.connect(&h.link).unwrap();
        h.sim.terminate_link(h.link.conn_handle());
        h.sim.run_until_idle();

        assert_eq!(client.state(), CocState::Disconnected);
        assert!(client_watch.record().connects.is_empty());
        // Never connected, so no disconnect callback either
        assert_eq!(client_watch.record().disconnects, 0);
        assert!(h.service().state().is_idle());

        let fresh = h.sim.establish_link();
        client.connect(&fresh).unwrap();
        h.sim.run_until_idle();
        assert!(client.is_connected());
        assert!(h.service().is_connected());
    }

    #[test]
    fn test_client_dropped_while_connecting_frees_service() {
        let mut h = Harness::with_window(8);
        let service_watch = Watch::default();
        h.serve(TEST_PSM, 200, &service_watch);

        let client = h.client(TEST_PSM, 200, &Watch::default());
        client.connect(&h.link).unwrap();
        drop(client);
        h.sim.run_until_idle();

        assert_eq!(h.service().state(), CocState::Disconnected);
        assert!(h.sim.open_channels().is_empty());

        let next = h.client(TEST_PSM, 200, &Watch::default());
        next.connect(&h.link).unwrap();
        h.sim.run_until_idle();
        assert!(next.is_connected());
        assert!(h.service().is_connected());
    }

    #[test]
    fn test_link_loss_disconnects_channels() {
        let mut h = Harness::with_window(8);
        let (client, service_watch, client_watch) = h.connected_pair(200, 200);

        h.sim.terminate_link(h.link.conn_handle());
        h.sim.run_until_idle();

        assert_eq!(client.state(), CocState::Disconnected);
        assert_eq!(h.service().state(), CocState::Disconnected);
        assert_eq!(client_watch.record().disconnects, 1);
        assert_eq!(service_watch.record().disconnects, 1);
    }

    #[test]
    fn test_channel_echo() {
        let mut h = Harness::with_window(8);
        let service_watch = Watch::echoing();
        h.serve(TEST_PSM, 256, &service_watch);

        let channel_watch = Watch::default();
        let channel = L2capChannel::connect_with_config(
            h.host.clone(),
            &h.link,
            TEST_PSM,
            256,
            channel_watch.callbacks(),
            h.config,
        )
        .unwrap();
        h.sim.run_until_idle();
        assert!(channel.is_connected());

        channel.write(b"ping").unwrap();
        h.sim.run_until_idle();
        assert_eq!(channel_watch.record().reads, vec![b"ping".to_vec()]);
        assert_eq!(service_watch.record().reads, vec![b"ping".to_vec()]);

        let down = SimLink::down(ConnHandle(0x0042));
        assert!(matches!(
            L2capChannel::connect(h.host.clone(), &down, TEST_PSM, 256, Watch::default().callbacks()),
            Err(L2capError::NotConnected)
        ));
    }

    #[test]
    fn test_allocation_failure_disables_endpoint() {
        // Block count overflows any allocation
        let config = CocConfig {
            block_size: 1,
            mtus_per_channel: usize::MAX / 100,
            ..CocConfig::default()
        };
        let mut h = Harness::new(SimConfig::default(), config);
        let watch = Watch::default();

        let client = h.client(TEST_PSM, 100, &watch);
        assert!(!client.is_valid());
        assert!(client.buffer_pool().is_none());
        assert!(matches!(
            client.connect(&h.link),
            Err(L2capError::ResourceLimitReached)
        ));
        assert!(matches!(
            client.write(b"x"),
            Err(L2capError::ResourceLimitReached)
        ));
        assert_eq!(client.state(), CocState::Idle);

        assert!(matches!(
            h.server.create_service(TEST_PSM, 100, watch.callbacks()),
            Err(L2capError::ResourceLimitReached)
        ));
        assert!(h.server.is_empty());

        assert!(matches!(
            L2capChannel::connect_with_config(
                h.host.clone(),
                &h.link,
                TEST_PSM,
                100,
                watch.callbacks(),
                config,
            ),
            Err(L2capError::ResourceLimitReached)
        ));
    }

    #[test]
    fn test_invalid_config_disables_endpoint() {
        init();
        let sim = Arc::new(SimHost::default());
        let host: Arc<dyn HostStack> = sim.clone();
        let link = sim.establish_link();

        let single_mtu = CocConfig {
            mtus_per_channel: 1,
            ..CocConfig::default()
        };
        let zero_block = CocConfig {
            block_size: 0,
            ..CocConfig::default()
        };
        assert!(matches!(
            single_mtu.validate(),
            Err(L2capError::InvalidParameter(_))
        ));
        assert!(matches!(
            zero_block.validate(),
            Err(L2capError::InvalidParameter(_))
        ));
        assert_eq!(zero_block.pool_blocks(500), None);
        assert!(matches!(
            BufferPool::for_mtu(500, &zero_block),
            Err(L2capError::InvalidParameter(_))
        ));

        for config in [single_mtu, zero_block] {
            let client = L2capClient::create_client_with_config(
                host.clone(),
                TEST_PSM,
                500,
                Watch::default().callbacks(),
                config,
            );
            assert!(!client.is_valid());
            assert!(matches!(
                client.connect(&link),
                Err(L2capError::ResourceLimitReached)
            ));
            assert!(matches!(
                client.write(&[0; 500]),
                Err(L2capError::ResourceLimitReached)
            ));

            let mut server = L2capServer::with_config(host.clone(), config);
            assert!(matches!(
                server.create_service(TEST_PSM, 500, Watch::default().callbacks()),
                Err(L2capError::ResourceLimitReached)
            ));
        }

        // Overflowing block count
        let huge = CocConfig {
            mtus_per_channel: usize::MAX,
            ..CocConfig::default()
        };
        assert_eq!(huge.pool_blocks(500), None);
        assert!(BufferPool::for_mtu(500, &huge).is_err());
    }

    #[test]
    fn test_smallest_pool_still_writes_full_segments() {
        let config = CocConfig {
            mtus_per_channel: 2,
            ..CocConfig::default()
        };
        let mut h = Harness::new(SimConfig { tx_window: 16 }, config);
        let (client, service_watch, _) = h.connected_pair(500, 500);
        assert_eq!(client.buffer_pool().unwrap().capacity(), 4);

        client.write(&[6; 1500]).unwrap();
        h.sim.run_until_idle();
        assert_eq!(h.accepted_sends(), vec![500; 3]);
        assert_eq!(service_watch.record().received(), vec![6; 1500]);
    }

    #[test]
    #[should_panic]
    fn test_zero_mtu_panics() {
        let h = Harness::with_window(8);
        let _ = h.client(TEST_PSM, 0, &Watch::default());
    }

    #[test]
    fn test_host_codes() {
        assert_eq!(L2capError::ConnectionRejected.host_code(), HostError::Rejected);
        assert_eq!(L2capError::ResourceLimitReached.host_code(), HostError::NoMemory);
        assert_eq!(
            L2capError::from(HostError::Stalled).host_code(),
            HostError::Stalled
        );
        assert!(HostError::Stalled.is_backpressure());
        assert!(!HostError::NoMemory.is_backpressure());
    }
}
