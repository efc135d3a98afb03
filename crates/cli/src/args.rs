//! Client command-line arguments.

use std::ffi::OsString;

use clap::{Arg, Command, value_parser};

/// Where the client should connect.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
}

fn command() -> Command {
    Command::new("depot")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Interactive client for the depot file storage daemon")
        .arg(
            Arg::new("host")
                .long("host")
                .value_name("HOST")
                .help("Server host")
                .default_value("127.0.0.1"),
        )
        .arg(
            Arg::new("port")
                .long("port")
                .value_name("PORT")
                .help("Server TCP port")
                .value_parser(value_parser!(u16))
                .default_value("9000"),
        )
}

/// Parses client command-line arguments.
pub fn parse_args<I, T>(args: I) -> Result<ClientOptions, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let matches = command().try_get_matches_from(args)?;
    Ok(ClientOptions {
        host: matches
            .get_one::<String>("host")
            .cloned()
            .unwrap_or_else(|| "127.0.0.1".to_owned()),
        port: *matches.get_one::<u16>("port").unwrap_or(&9000),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_local_daemon() {
        let options = parse_args(["depot"]).unwrap();
        assert_eq!(options.host, "127.0.0.1");
        assert_eq!(options.port, 9000);
    }

    #[test]
    fn accepts_host_and_port() {
        let options = parse_args(["depot", "--host", "example.net", "--port", "9900"]).unwrap();
        assert_eq!(options.host, "example.net");
        assert_eq!(options.port, 9900);
    }

    #[test]
    fn rejects_bad_port() {
        assert!(parse_args(["depot", "--port", "notaport"]).is_err());
    }
}
