use std::process::ExitCode;

fn main() -> ExitCode {
    leaveflow_cli::run()
}
