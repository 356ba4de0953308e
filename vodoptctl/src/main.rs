use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = vodoptctl::Cli::parse();
    vodoptctl::init_logging(cli.verbose);
    if let Err(err) = vodoptctl::run(cli).await {
        eprintln!("erro: {err}");
        std::process::exit(1);
    }
}
