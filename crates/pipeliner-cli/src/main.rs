//! pipeliner - build event stream server

use std::process::ExitCode;

#[tokio::main]
async fn main() -> ExitCode {
    match pipeliner_cli::run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
