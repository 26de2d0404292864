use std::{net::UdpSocket, thread, time::Duration};

use statsd_agent::{AgentBuilder, Cluster, ParserStrategy, ProcUptime};

fn main() {
    tracing_subscriber::fmt::init();

    let agent = AgentBuilder::default()
        .with_listen_address("127.0.0.1:8125")
        .expect("failed to parse listen address")
        .with_parser(ParserStrategy::Grammar)
        .with_quantiles(&[0.5, 0.9, 0.99])
        .expect("invalid quantiles")
        .with_uptime_source(ProcUptime::default())
        .build()
        .expect("failed to start statsd agent");

    let addr = agent.local_addr();
    thread::spawn(move || {
        let client = UdpSocket::bind("127.0.0.1:0").expect("failed to bind client socket");
        let mut i = 0u64;

        // Loop over and over, pretending to be an application emitting metrics.
        loop {
            let payload = format!(
                "requests:1|c|#route:index\nlatency:{}|ms\nqueue_depth:{}|g\nvisitors:user-{}|s",
                10 + i % 90,
                i % 32,
                i % 7,
            );
            let _ = client.send_to(payload.as_bytes(), addr);
            i += 1;
            thread::sleep(Duration::from_millis(10));
        }
    });

    loop {
        thread::sleep(Duration::from_secs(5));

        for cluster in Cluster::ALL {
            match agent.refresh(cluster) {
                Ok(instances) => {
                    for instance in instances {
                        println!("{}[{}] = {}", instance.name, instance.instance, instance.value);
                    }
                }
                Err(e) => eprintln!("failed to refresh cluster {}: {}", cluster.id(), e),
            }
        }
        println!();
    }
}
