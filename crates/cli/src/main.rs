use std::process::ExitCode;

fn main() -> ExitCode {
    datapilot_cli::run()
}
