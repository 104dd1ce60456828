use std::error::Error as StdError;

use env_logger::{Builder, Env};
use log::{info, LevelFilter};

use pe_loader::arch::HOST_ARCH;
use pe_loader::{run, run_with_export, AppError};

use crate::arg_parser::parse_args;

mod arg_parser;

fn main() {
    init_logging();

    if let Err(err) = run_cli() {
        log::error!("{err}");

        // Print chained causes (useful with #[from]).
        let mut source = err.source();
        while let Some(cause) = source {
            log::error!("  caused by: {cause}");
            source = cause.source();
        }

        std::process::exit(1);
    }
}

/// Initializes logging.
///
/// Behavior:
/// - Respects `RUST_LOG` (e.g. `RUST_LOG=pe_loader=debug`)
/// - Defaults to `info`
/// - Compact format with timestamp, level and target
fn init_logging() {
    let env = Env::default().filter_or("RUST_LOG", "info");

    Builder::from_env(env)
        .filter_level(LevelFilter::Info)
        .format(|buf, record| {
            use std::io::Write;

            writeln!(
                buf,
                "[{} {:<5} {}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

fn run_cli() -> Result<(), AppError> {
    let args = parse_args();

    info!("host architecture: {HOST_ARCH}");

    match args.export {
        Some(export) => run_with_export(&args.pe, export),
        None => run(&args.pe),
    }
}
