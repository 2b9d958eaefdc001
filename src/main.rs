use anyhow::Result;

use agentx::run_cli;

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    run_cli().await
}
