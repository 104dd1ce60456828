use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "pe_loader", disable_help_subcommand = true)]
pub struct Args {
    /// Path to the PE image to run
    #[arg(short = 'p', long = "pe", value_name = "FILE")]
    pub pe: String,

    /// Export to execute after attaching (DLL only)
    #[arg(long = "export", value_name = "NAME")]
    pub export: Option<String>,
}

pub fn parse_args() -> Args {
    Args::parse()
}
