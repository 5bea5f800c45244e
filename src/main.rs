//! Key transparency sequencer service entry point

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    keytrans_sequencer::server::run().await
}
