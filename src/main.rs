use clap::Parser;

use jail::cli::Args;
use jail::engine::{self, Config};
use jail::logging;

fn main() {
    logging::init_stderr();

    let args = Args::parse();

    let code = match Config::from_args(args).and_then(engine::run) {
        Ok(code) => code,
        Err(e) => {
            log::error!("{}", e);
            e.exit_code()
        }
    };

    std::process::exit(code);
}
