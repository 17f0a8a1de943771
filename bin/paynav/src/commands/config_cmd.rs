use paynav_core::{Config, Paths};
use std::path::Path;

/// Write a default configuration file.
pub async fn init(override_path: Option<&Path>, force: bool) -> anyhow::Result<()> {
    let paths = Paths::new();
    let path = super::config_path(&paths, override_path);

    if path.exists() && !force {
        anyhow::bail!(
            "Config already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }

    let mut config = Config::default();
    config
        .sites
        .insert("example-utility".to_string(), "https://www.example.com/".to_string());
    config.save(&path)?;

    println!("✓ Wrote {}", path.display());
    println!("  Set provider.apiKey (or PAYNAV_API_KEY) and add your sites before running.");
    Ok(())
}

/// Show the current configuration as pretty-printed JSON. The API key is masked.
pub async fn show(override_path: Option<&Path>) -> anyhow::Result<()> {
    let paths = Paths::new();
    let path = super::config_path(&paths, override_path);
    let mut config = super::load_config(&paths, override_path)?;
    config.provider.api_key = mask_key(&config.provider.api_key);

    println!();
    println!("📋 Current Configuration");
    println!(
        "  File: {}{}",
        path.display(),
        if path.exists() { "" } else { " (not found, showing defaults)" }
    );
    println!();
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.is_empty() {
        return String::new();
    }
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}****{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_key() {
        assert_eq!(mask_key(""), "");
        assert_eq!(mask_key("short"), "****");
        assert_eq!(mask_key("sk-abcdefghijklmnop"), "sk-a****mnop");
    }
}
