pub mod config;
pub mod model;
pub mod negotiation;
pub mod peer;
pub mod relay;
pub mod rtc;
pub mod server;

use std::env;

mod util;

fn main() {
    let args: Vec<String> = env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("server") => {
            println!("Starting relay...");
            if let Err(e) = server::main() {
                eprintln!("Relay error:\n{:#}", e);
            }
        }
        Some("peer") => {
            let Some(channel) = args.get(2) else {
                print_usage();
                return;
            };
            let call = args.get(3).is_some_and(|arg| arg == "call");
            println!("Starting peer on '{}'...", channel);
            match peer::main(channel.clone(), call) {
                Ok(_) => println!("Peer completed successfully"),
                Err(e) => eprintln!("Peer error:\n{:#}", e),
            }
        }
        _ => print_usage(),
    }
}

fn print_usage() {
    println!("Channel RTC");
    println!("Usage:");
    println!("  cargo run server                - Start the signaling relay");
    println!("  cargo run peer <channel>        - Join a channel and answer calls");
    println!("  cargo run peer <channel> call   - Join a channel and start a call");
}
