use clap::Parser;

fn main() {
    let cli = loopcastctl::Cli::parse();
    if let Err(err) = loopcastctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}
