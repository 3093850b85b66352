use anyhow::Result;

#[tokio::main]
async fn main() -> Result<()> {
    forgemesh::node::cli::run_cli().await
}
