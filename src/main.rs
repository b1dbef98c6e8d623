//! privcount-control CLI entry point.
//!
//! The binary is the operator's companion to the library: it writes a
//! default configuration, hashes control passwords in the configured format,
//! checks a password against the configured hashes, and otherwise loads and
//! reports the effective configuration.
//!
//! # Startup Flow
//!
//! ```text
//!   ┌─────────────────┐
//!   │  Parse CLI Args │ ◄── clap parses command-line arguments
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌──────────────────┐      ┌─────────────────┐
//!   │ --generate_config│────▶│ Write default   │────▶ Exit
//!   │ --hash-password  │      │ config / print │
//!   └────────┬─────────┘      │ 16:<hex> hash   │
//!            │ No             └─────────────────┘
//!            ▼
//!   ┌─────────────────┐
//!   │  Load Config    │ ◄── Defaults → File → CLI
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌─────────────────┐
//!   │ Initialize      │ ◄── Set up tracing subscriber
//!   │   Logging       │
//!   └────────┬────────┘
//!            │
//!            ▼
//!   ┌──────────────────┐
//!   │ --verify-password│ ◄── Exit 0 on match, 1 otherwise
//!   │ or report config │
//!   └──────────────────┘
//! ```
//!
//! # Usage Examples
//!
//! ```bash
//! # Hash a control password for hashed_control_passwords
//! privcount-control --hash-password 'correct horse'
//!
//! # Generate default configuration file
//! privcount-control --generate_config privcount-control.toml
//!
//! # Check a password against the configured hashes
//! privcount-control --config privcount-control.toml --verify-password 'correct horse'
//! ```
//!
//! # Exit Codes
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | Success |
//! | 1 | Error, or password did not verify |

use clap::Parser;
use std::process::ExitCode;

use privcount_control::auth::{
    AuthCookie, ConfiguredAuth, Credential, CredentialVerifier, SecurePassword,
};
use privcount_control::{
    config, logger, CliArgs, Config, EventMask, HashedPassword, LogLevel, VERSION,
};

fn main() -> ExitCode {
    match run() {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> privcount_control::Result<bool> {
    let args = CliArgs::parse();

    if let Some(ref output_path) = args.generate_config {
        let config = Config::default();
        let toml = config.to_toml()?;
        std::fs::write(output_path, toml)?;
        println!("Wrote default config to {}", output_path.display());
        return Ok(true);
    }

    if let Some(ref password) = args.hash_password {
        let secret = SecurePassword::new(password.clone().into_bytes());
        println!("{}", HashedPassword::generate(secret.as_bytes()));
        return Ok(true);
    }

    let config = config::load_config(&args)?;
    logger::init(config.loglevel, config.logfile.as_deref())?;

    logger::plog(
        LogLevel::Notice,
        &format!("privcount-control {} starting", VERSION),
    );

    let cookie = config.cookie_authentication.then(AuthCookie::generate);
    let auth = ConfiguredAuth::from_config(&config, cookie)?;

    if let Some(ref password) = args.verify_password {
        let credential = Credential::Secret(SecurePassword::new(password.clone().into_bytes()));
        let ok = auth.verify(&credential);
        println!("{}", if ok { "Password accepted" } else { "Password rejected" });
        return Ok(ok);
    }

    logger::plog(
        LogLevel::Info,
        &format!(
            "{} hashed control passwords, cookie authentication {}",
            config.hashed_control_passwords.len(),
            if config.cookie_authentication { "enabled" } else { "disabled" }
        ),
    );
    if auth.is_open() {
        logger::plog(
            LogLevel::Warn,
            "No authentication method configured; any session may authenticate",
        );
    }
    logger::plog(
        LogLevel::Debug,
        &format!(
            "Max auth failures: {}, flush threshold: {}",
            config.registry.max_auth_failures, config.registry.flush_threshold
        ),
    );
    if config.privcount.enabled {
        logger::plog(
            LogLevel::Info,
            &format!(
                "PrivCount events enabled ({} event kinds, directory traffic {})",
                EventMask::ALL_VALID.kinds().filter(|k| k.is_privcount()).count(),
                if config.privcount.exclude_directory_traffic {
                    "excluded"
                } else {
                    "included"
                }
            ),
        );
    }

    logger::plog(LogLevel::Notice, "Configuration loaded successfully");
    Ok(true)
}
