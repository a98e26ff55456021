//! Check command handler.
//!
//! Reports whether the engine library exists and which host executable
//! would be launched, without starting anything.

use anyhow::{Result, bail};
use eci_client::{EngineOptions, engine_available};

use crate::handlers::{client_config, engine_path};
use crate::parser::Cli;

/// Execute the check command. Fails if either piece is missing.
pub fn execute(cli: &Cli) -> Result<()> {
    let options = EngineOptions::new(engine_path(cli)?);
    let engine_ok = engine_available(&options);
    println!(
        "engine = {} ({})",
        options.engine_path.display(),
        if engine_ok { "found" } else { "missing" }
    );

    let host = client_config(cli).resolve_host();
    match &host {
        Ok(host) => println!(
            "host   = {} (from {:?})",
            host.program().display(),
            host.source
        ),
        Err(e) => println!("host   = {e}"),
    }

    if !engine_ok || host.is_err() {
        bail!("engine is not available");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn missing_engine_library_fails() {
        let cli = Cli::parse_from([
            "eci",
            "--engine",
            "/nonexistent/eci.so",
            "--host-command",
            "/bin/true",
            "check",
        ]);
        assert!(execute(&cli).is_err());
    }

    #[test]
    fn present_engine_library_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let engine = dir.path().join("eci.so");
        std::fs::write(&engine, b"").unwrap();
        let options = EngineOptions::new(engine);
        assert!(engine_available(&options));
    }
}
