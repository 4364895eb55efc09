// Environment overrides for configuration
//
// Kept in its own test binary: it sets process-wide environment variables.

use anyhow::Result;
use classroom_link::config::Config;

#[test]
fn test_environment_overrides_file() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("device.toml");
    std::fs::write(&path, "[server]\nhost = \"10.0.0.1\"\ncommand_port = 9002\n")?;

    std::env::set_var("CLASSROOM__SERVER__HOST", "192.168.4.20");
    std::env::set_var("CLASSROOM__HTTP__PORT", "9090");

    let cfg = Config::load(Some(&path.to_string_lossy()))?;

    std::env::remove_var("CLASSROOM__SERVER__HOST");
    std::env::remove_var("CLASSROOM__HTTP__PORT");

    assert_eq!(cfg.server.host, "192.168.4.20");
    assert_eq!(cfg.server.command_port, 9002);
    assert_eq!(cfg.http.port, 9090);
    Ok(())
}
