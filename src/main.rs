// src/main.rs

use agentdag::{cli, logging, run};

#[tokio::main]
async fn main() {
    match run_main().await {
        Ok(success) => {
            if !success {
                std::process::exit(1);
            }
        }
        Err(err) => {
            eprintln!("agentdag error: {err:?}");
            std::process::exit(1);
        }
    }
}

async fn run_main() -> anyhow::Result<bool> {
    let args = cli::parse();
    logging::init_logging(args.log_level)?;
    let summary = run(args).await?;
    Ok(summary.success)
}
