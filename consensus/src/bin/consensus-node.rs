use std::fs::File;
use std::time::SystemTime;

use arrrg::CommandLine;
use biometrics::{Collector, PlainTextEmitter};

use consensus::node::{self, NodeOptions};

fn main() {
    std::thread::spawn(|| {
        let mut collector = Collector::new();
        consensus::register_biometrics(&collector);
        let mut hey_listen = tatl::HeyListen::new();
        consensus::register_monitors(&mut hey_listen);
        let fout = match File::create("/dev/stdout") {
            Ok(fout) => fout,
            Err(_) => return,
        };
        let mut emit = PlainTextEmitter::new(fout);
        loop {
            let now: u64 = SystemTime::now()
                .duration_since(SystemTime::UNIX_EPOCH)
                .expect("clock should never fail")
                .as_millis()
                .try_into()
                .expect("millis since epoch should fit u64");
            if let Err(e) = collector.emit(&mut emit, now) {
                eprintln!("collector error: {e:?}");
            }
            hey_listen.evaluate();
            for (label, _firing_id, initial, recent) in hey_listen.firing() {
                eprintln!("ALERT {label}: {recent:?} (since {initial:?})");
            }
            std::thread::sleep(std::time::Duration::from_millis(249));
        }
    });

    let (options, free) = NodeOptions::from_command_line_relaxed(
        "USAGE: consensus-node --port PORT --hub-host HOST --hub-port PORT --owner OWNER",
    );
    if !free.is_empty() {
        eprintln!("consensus-node ignores positional arguments");
    }

    if let Err(err) = node::run(options) {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}
