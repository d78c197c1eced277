use clap::Parser;
use lsp_lint::{run_and_output, Args, ExitStatus};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match run_and_output(args).await {
        Ok(ExitStatus::Ok) => {}
        Ok(ExitStatus::FoundViolations) => std::process::exit(3),
        Err(error) => {
            eprintln!("lsp-lint: {error}");
            std::process::exit(1);
        }
    }
}
