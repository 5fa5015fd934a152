use anyhow::Result;
use loadstar_engine::connector::{Connection, ConnectionResolver};
use loadstar_engine::EngineSettings;

/// Execute `conns list`: print every known connection without credentials.
pub fn list() -> Result<()> {
    let settings = EngineSettings::from_env()?;
    let resolver = ConnectionResolver::load(&settings.env_file())?;

    let mut rows: Vec<(String, String, &'static str)> = Vec::new();
    for name in resolver.names() {
        if let Ok(conn) = resolver.resolve(name) {
            rows.push((conn.name.clone(), conn.sanitized(), "env file"));
        }
    }
    for (key, value) in std::env::vars() {
        if rows.iter().any(|(name, _, _)| name.eq_ignore_ascii_case(&key)) {
            continue;
        }
        if let Some(conn) = Connection::from_url(&key, &value) {
            rows.push((key, conn.sanitized(), "env variable"));
        }
    }
    rows.sort_by(|a, b| a.0.cmp(&b.0));

    if rows.is_empty() {
        println!("No connections found in {}", settings.env_file().display());
        return Ok(());
    }
    println!("{:<30} {:<16} SOURCE", "NAME", "TYPE");
    for (name, scheme, source) in rows {
        println!("{name:<30} {scheme:<16} {source}");
    }
    Ok(())
}
