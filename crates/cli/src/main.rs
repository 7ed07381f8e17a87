use std::process::ExitCode;

fn main() -> ExitCode {
    eventcrew_cli::run()
}
