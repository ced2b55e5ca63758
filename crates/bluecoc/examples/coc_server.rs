/// Example hosting two L2CAP services on an in-memory host stack
use bluecoc::l2cap::{ChannelRole, Coc, Role, ServiceRole};
use bluecoc::*;
use std::sync::Arc;

/// Echoes every SDU back to the peer
struct Echo;

impl<R: Role> CocCallbacks<R> for Echo {
    fn on_connect(&mut self, coc: &Coc<R>, negotiated_mtu: u16) {
        println!("[echo {}] connected, peer MTU {}", coc.psm(), negotiated_mtu);
    }

    fn on_read(&mut self, coc: &Coc<R>, data: &[u8]) {
        println!("[echo {}] {} bytes", coc.psm(), data.len());
        if let Err(err) = coc.write(data) {
            eprintln!("[echo {}] write failed: {}", coc.psm(), err);
        }
    }

    fn on_disconnect(&mut self, coc: &Coc<R>) {
        println!("[echo {}] disconnected", coc.psm());
    }
}

impl ServiceCallbacks for Echo {}

/// Counts bytes and only accepts the first peer
struct Sink {
    received: usize,
    peers: usize,
}

impl CocCallbacks<ServiceRole> for Sink {
    fn on_read(&mut self, service: &L2capService, data: &[u8]) {
        self.received += data.len();
        println!("[sink {}] {} bytes total", service.psm(), self.received);
    }
}

impl ServiceCallbacks for Sink {
    fn should_accept_connection(&mut self, service: &L2capService) -> bool {
        self.peers += 1;
        println!("[sink {}] peer #{} asking", service.psm(), self.peers);
        self.peers == 1
    }
}

/// Prints whatever comes back
struct Printer;

impl CocCallbacks<ChannelRole> for Printer {
    fn on_read(&mut self, _channel: &L2capChannel, data: &[u8]) {
        println!("[channel] got {:?}", String::from_utf8_lossy(data));
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    println!("L2CAP COC Server Example");
    println!("------------------------");

    let sim = Arc::new(SimHost::default());
    let host: Arc<dyn HostStack> = sim.clone();
    let link = sim.establish_link();

    let echo_psm = bluecoc::l2cap::obtain_dynamic_psm();
    let sink_psm = bluecoc::l2cap::obtain_dynamic_psm();

    let mut server = L2capServer::new(host.clone());
    server.create_service(echo_psm, 512, Box::new(Echo))?;
    server.create_service(
        sink_psm,
        1024,
        Box::new(Sink {
            received: 0,
            peers: 0,
        }),
    )?;
    for service in server.services() {
        println!("Listening on {} with MTU {}", service.psm(), service.mtu());
    }

    // Talk to the echo service
    let channel = L2capChannel::connect(host.clone(), &link, echo_psm, 256, Box::new(Printer))?;
    sim.run_until_idle();
    channel.write(b"hello over COC")?;
    sim.run_until_idle();

    // Two peers for the sink; only the first gets in
    let first = L2capChannel::connect(host.clone(), &link, sink_psm, 256, Box::new(Echo))?;
    let second = L2capChannel::connect(host.clone(), &link, sink_psm, 256, Box::new(Echo))?;
    sim.run_until_idle();
    println!(
        "First peer {}, second peer {}",
        first.state(),
        second.state()
    );

    first.write(&[0xA5; 1500])?;
    sim.run_until_idle();

    drop(server);
    sim.run_until_idle();
    println!("Server gone, channel is {}", channel.state());

    Ok(())
}
