use std::process::ExitCode;

fn main() -> ExitCode {
    setter_cli::run()
}
