//! Command-line interface parsing for shellcache
//!
//! This module handles parsing of CLI arguments using clap and turns the
//! request-shaped subcommands into [`Request`] values.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use reqwest::Method;
use thiserror::Error;
use url::Url;

use crate::control::ControlCommand;
use crate::request::Request;

/// Error types for CLI argument parsing
#[derive(Debug, Error)]
pub enum CliError {
    /// The URL argument is not an absolute URL
    #[error("Invalid URL: '{0}'. Expected an absolute URL such as https://app.example.com/")]
    InvalidUrl(String),

    /// The method is not a valid HTTP token
    #[error("Invalid method: '{0}'")]
    InvalidMethod(String),

    /// The control command name is not recognized
    #[error("Invalid command: '{0}'. Valid commands: force-activate, purge-all")]
    InvalidCommand(String),
}

/// shellcache - versioned HTTP response cache for offline-tolerant clients
#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Versioned HTTP response cache with per-request fetch strategies")]
#[command(version)]
pub struct Cli {
    /// Configuration file (defaults to the XDG config directory)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Cache store directory, overriding the configuration file
    #[arg(long, global = true, value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Log filter directive used when RUST_LOG is unset
    #[arg(long, global = true, value_name = "LEVEL", default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Install the configured version and activate it
    Install {
        /// Leave the new version waiting until `control force-activate`
        #[arg(long)]
        defer: bool,
    },

    /// Fetch a URL through the cache
    ///
    /// Status and headers go to stderr, the body to stdout.
    Get(RequestArgs),

    /// Print how a URL would be routed without fetching it
    Classify(RequestArgs),

    /// List generations in the cache store
    Generations,

    /// Send a control command
    ///
    /// Valid commands: force-activate, purge-all
    Control {
        #[arg(value_name = "COMMAND", value_parser = parse_command_arg)]
        command: ControlCommand,
    },
}

/// Arguments describing one request
#[derive(Args, Debug, Clone)]
pub struct RequestArgs {
    /// Absolute request URL
    pub url: String,

    /// Treat the request as a top-level page navigation
    #[arg(long)]
    pub navigate: bool,

    /// Value for the Accept header
    #[arg(long, value_name = "MIME")]
    pub accept: Option<String>,

    /// HTTP method
    #[arg(short = 'X', long, value_name = "METHOD", default_value = "GET")]
    pub method: String,
}

impl RequestArgs {
    /// Builds the request these arguments describe.
    ///
    /// # Returns
    /// * `Ok(Request)` for an absolute URL and a valid method
    /// * `Err(CliError)` otherwise
    pub fn to_request(&self) -> Result<Request, CliError> {
        let url = Url::parse(&self.url).map_err(|_| CliError::InvalidUrl(self.url.clone()))?;
        let method = Method::from_bytes(self.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| CliError::InvalidMethod(self.method.clone()))?;

        let mut request = Request::new(method, url);
        request.navigate = self.navigate;
        if let Some(accept) = &self.accept {
            request = request.with_header("accept", accept.clone());
        }
        Ok(request)
    }
}

/// Parses a control command argument.
///
/// # Returns
/// * `Ok(ControlCommand)` if the string names a command
/// * `Err(CliError::InvalidCommand)` if it doesn't
pub fn parse_command_arg(s: &str) -> Result<ControlCommand, CliError> {
    s.parse::<ControlCommand>()
        .map_err(|_| CliError::InvalidCommand(s.to_string()))
}
