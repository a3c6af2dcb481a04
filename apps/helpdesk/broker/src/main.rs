//! Helpdesk Broker Service - Entry Point
//!
//! HTTP front door that publishes jobs onto the `jobs` exchange.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    helpdesk_broker::run().await
}
