//! Prints a fresh receiver key pair.
//!
//! The public key goes into the sink configuration, the private key stays with
//! whoever runs `shiplog-decode`.

use clap::Parser;
use shiplog_core::SessionKeys;

#[derive(Parser, Debug)]
#[command(name = "shiplog-keygen")]
#[command(about = "Generate a P-256 receiver key pair for shiplog", long_about = None)]
struct Cli {
    /// Print only the two hex strings, private key first.
    #[arg(long)]
    quiet: bool,
}

fn main() {
    let cli = Cli::parse();
    let keys = SessionKeys::generate();
    if cli.quiet {
        println!("{}", keys.secret_key_hex());
        println!("{}", keys.public_key_hex());
    } else {
        println!("private key: {}", keys.secret_key_hex());
        println!("public key:  {}", keys.public_key_hex());
    }
}
