use solver_node::cli::run_cli;

#[tokio::main]
async fn main() -> Result<(), String> {
    run_cli().await
}
