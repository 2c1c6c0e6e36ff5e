mod api;
mod cli;
mod conf;
mod manager;
mod models;
mod queue;
mod runner;
mod scheduler;
mod scripthost;

#[tokio::main]
async fn main() {
    human_panic::setup_panic!();
    cli::init().await;
}
