//! `depot` — interactive client for the depot daemon.

use std::env;
use std::process::ExitCode;

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

fn main() -> ExitCode {
    cli::run(env::args_os())
}
