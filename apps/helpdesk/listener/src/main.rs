//! Helpdesk Listener Service - Entry Point
//!
//! Consumes the job queues and dispatches each delivery to its handler.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    helpdesk_listener::run().await
}
