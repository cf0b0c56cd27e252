use clap::Parser;
use containerize::cli::{dispatch, Cli};
use containerize::logging::Logger;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = dispatch(cli).await {
        Logger::default().error(&err.to_string());
        std::process::exit(1);
    }
}
