// src/main.rs

use nodeward::{cli, run};

#[tokio::main]
async fn main() {
    if let Err(err) = run(cli::parse()).await {
        eprintln!("nodeward error: {err:?}");
        std::process::exit(1);
    }
}
