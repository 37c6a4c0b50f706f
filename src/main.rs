// src/main.rs

use hypermake::{cli, logging, run};

#[tokio::main]
async fn main() {
    let args = cli::parse();
    if let Err(err) = logging::init_logging(args.log_level) {
        eprintln!("hmake: logging setup failed: {err:?}");
    }
    match run(args).await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("hmake error: {err:#}");
            std::process::exit(1);
        }
    }
}
