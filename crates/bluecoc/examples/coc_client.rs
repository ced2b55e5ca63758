/// Example of a reconnecting L2CAP client
///
/// A discovery thread hands peers to a connection task over a bounded
/// channel. A third thread drives the in-memory host stack.
use bluecoc::l2cap::{ClientRole, Coc, Role};
use bluecoc::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

/// Echoes every SDU back
struct Echo;

impl<R: Role> CocCallbacks<R> for Echo {
    fn on_read(&mut self, coc: &Coc<R>, data: &[u8]) {
        if let Err(err) = coc.write(data) {
            eprintln!("[peer] echo failed: {}", err);
        }
    }
}

impl ServiceCallbacks for Echo {}

struct Counter {
    echoed: Arc<AtomicUsize>,
}

impl CocCallbacks<ClientRole> for Counter {
    fn on_connect(&mut self, client: &L2capClient, negotiated_mtu: u16) {
        println!("[client {}] connected, peer MTU {}", client.psm(), negotiated_mtu);
    }

    fn on_read(&mut self, _client: &L2capClient, data: &[u8]) {
        self.echoed.fetch_add(data.len(), Ordering::SeqCst);
    }

    fn on_disconnect(&mut self, client: &L2capClient) {
        println!("[client {}] disconnected", client.psm());
    }
}

impl ClientCallbacks for Counter {
    fn on_mtu_change(&mut self, client: &L2capClient, mtu: u16) {
        println!("[client {}] peer MTU changed to {}", client.psm(), mtu);
    }
}

fn wait_for(what: &str, mut done: impl FnMut() -> bool) -> Result<(), String> {
    for _ in 0..500 {
        if done() {
            return Ok(());
        }
        thread::sleep(Duration::from_millis(2));
    }
    Err(format!("timed out waiting for {}", what))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("L2CAP COC Client Example");
    println!("------------------------");

    let sim = Arc::new(SimHost::default());
    let host: Arc<dyn HostStack> = sim.clone();
    let psm = Psm::new(0x0085);

    // The "remote" device
    let mut server = L2capServer::new(host.clone());
    server.create_service(psm, 512, Box::new(Echo))?;

    let stop = Arc::new(AtomicBool::new(false));
    let pump = {
        let sim = sim.clone();
        let stop = stop.clone();
        thread::spawn(move || {
            while !stop.load(Ordering::SeqCst) {
                if sim.run_until_idle() == 0 {
                    thread::sleep(Duration::from_millis(1));
                }
            }
        })
    };

    // Discovery hands over at most one pending peer at a time
    let (peer_tx, peer_rx) = mpsc::sync_channel::<SimLink>(1);
    let discovery = {
        let sim = sim.clone();
        thread::spawn(move || {
            for round in 1..=2 {
                println!("[discovery] round {} found a peer", round);
                if peer_tx.send(sim.establish_link()).is_err() {
                    break;
                }
            }
        })
    };

    let echoed = Arc::new(AtomicUsize::new(0));
    let client = L2capClient::create_client(
        host.clone(),
        psm,
        256,
        Box::new(Counter {
            echoed: echoed.clone(),
        }),
    );

    let mut expected = 0;
    for link in peer_rx {
        client.connect(&link)?;
        wait_for("connect", || client.is_connected())?;

        let payload = vec![0x42; 1500];
        client.write(&payload)?;
        expected += payload.len();
        wait_for("echo", || echoed.load(Ordering::SeqCst) == expected)?;
        println!("[client] {} bytes echoed so far", expected);

        sim.terminate_link(link.conn_handle());
        wait_for("disconnect", || !client.is_connected())?;
    }

    discovery.join().map_err(|_| "discovery thread panicked")?;
    stop.store(true, Ordering::SeqCst);
    pump.join().map_err(|_| "host thread panicked")?;

    println!("Done, client is {}", client.state());
    Ok(())
}
