//! Interactive client for the depot daemon.
//!
//! Connects to a server and turns REPL input into wire commands:
//!
//! ```text
//! signup <user> [pass]        create an account
//! login <user> [pass]         authenticate this connection
//! upload <local-path> [name]  store a file (name defaults to the basename)
//! download <name> [local]     fetch a file (local defaults to the name)
//! delete <name>               remove a file
//! list                        show stored files
//! quit                        leave
//! ```
//!
//! Passwords not given inline are prompted without echo.

mod args;
mod client;

use std::ffi::OsString;
use std::io::{self, Write};
use std::net::TcpStream;
use std::process::ExitCode;

pub use args::{ClientOptions, parse_args};
pub use client::{ClientError, DepotClient};

/// Entry point for the `depot` binary.
pub fn run<I, T>(argv: I) -> ExitCode
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let options = match parse_args(argv) {
        Ok(options) => options,
        Err(err) => {
            // clap renders --help/--version through the same path.
            let _ = err.print();
            return if err.use_stderr() {
                ExitCode::from(2)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    let address = (options.host.as_str(), options.port);
    let stream = match TcpStream::connect(address) {
        Ok(stream) => stream,
        Err(err) => {
            eprintln!("depot: cannot connect to {}:{}: {err}", options.host, options.port);
            return ExitCode::FAILURE;
        }
    };
    let mut client = match DepotClient::new(stream) {
        Ok(client) => client,
        Err(err) => {
            eprintln!("depot: {err}");
            return ExitCode::FAILURE;
        }
    };

    eprintln!("connected to {}:{}; type 'help' for commands", options.host, options.port);
    match repl(&mut client) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("depot: {err}");
            ExitCode::FAILURE
        }
    }
}

fn repl(client: &mut DepotClient) -> io::Result<()> {
    let stdin = io::stdin();
    let mut line = String::new();
    loop {
        eprint!("> ");
        io::stderr().flush()?;
        line.clear();
        if stdin.read_line(&mut line)? == 0 {
            return Ok(());
        }
        let mut tokens = line.split_whitespace();
        let Some(verb) = tokens.next() else { continue };
        let args: Vec<&str> = tokens.collect();

        let result = match verb {
            "quit" | "exit" => return Ok(()),
            "help" => {
                eprintln!(
                    "commands: signup <user> [pass] | login <user> [pass] | \
                     upload <local> [name] | download <name> [local] | \
                     delete <name> | list | quit"
                );
                continue;
            }
            "signup" => credentials(&args).map(|(user, pass)| client.signup(&user, &pass)),
            "login" => credentials(&args).map(|(user, pass)| client.login(&user, &pass)),
            "upload" => match args.as_slice() {
                [local] => Ok(client.upload(local, None)),
                [local, name] => Ok(client.upload(local, Some(*name))),
                _ => Err("usage: upload <local-path> [name]".to_owned()),
            },
            "download" => match args.as_slice() {
                [name] => Ok(client.download(name, None)),
                [name, local] => Ok(client.download(name, Some(*local))),
                _ => Err("usage: download <name> [local-path]".to_owned()),
            },
            "delete" => match args.as_slice() {
                [name] => Ok(client.delete(name)),
                _ => Err("usage: delete <name>".to_owned()),
            },
            "list" | "ls" => Ok(client.list()),
            other => Err(format!("unknown command {other:?}; try 'help'")),
        };

        match result {
            Err(usage) => eprintln!("{usage}"),
            Ok(Ok(message)) => println!("{message}"),
            Ok(Err(ClientError::Io(err))) => {
                return Err(err);
            }
            Ok(Err(err)) => eprintln!("error: {err}"),
        }
    }
}

/// Resolves `<user> [pass]`, prompting for the password when absent.
fn credentials(args: &[&str]) -> Result<(String, String), String> {
    match args {
        [user] => {
            let pass = rpassword::prompt_password("password: ")
                .map_err(|err| format!("cannot read password: {err}"))?;
            Ok(((*user).to_owned(), pass))
        }
        [user, pass] => Ok(((*user).to_owned(), (*pass).to_owned())),
        _ => Err("usage: <command> <user> [pass]".to_owned()),
    }
}
