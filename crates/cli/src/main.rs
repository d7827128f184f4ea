use std::process::ExitCode;

fn main() -> ExitCode {
    dealdesk_cli::run()
}
