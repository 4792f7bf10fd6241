//! Runs one command over SSH and prints its output.
//!
//! ```text
//! cargo run --example exec -- user@host:22 password "uname -a"
//! ```
//!
//! Host keys are accepted blindly; do not point this at anything you care
//! about.

use std::sync::Arc;

use capstan_proto::ssh::client::{Client, ClientConfig};
use capstan_proto::ssh::hostkey::AcceptAnyHostKey;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().init();

    let mut args = std::env::args().skip(1);
    let target = args.next().expect("usage: exec user@host:port password command");
    let password = args.next().expect("missing password");
    let command = args.next().expect("missing command");

    let (user, addr) = target
        .split_once('@')
        .expect("target must be user@host:port");

    let client = Client::connect(addr, ClientConfig::default(), vec![Arc::new(AcceptAnyHostKey)])
        .await?;
    if let Some(banner) = client.banner() {
        eprintln!("{}", banner);
    }
    client.auth_password(user, &password).await?;

    let output = client.execute(&command).await?;
    print!("{}", String::from_utf8_lossy(&output));

    client.disconnect().await;
    Ok(())
}
