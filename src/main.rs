use std::process::ExitCode;

fn main() -> ExitCode {
    mcp_probe::cli::main()
}
