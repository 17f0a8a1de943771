use paynav_core::Paths;
use paynav_tools::{ChromeLauncher, ToolName, Toolbox};
use std::path::Path;
use std::sync::Arc;

/// Print the function schemas advertised to the model.
pub async fn list(json: bool) -> anyhow::Result<()> {
    let schemas = Toolbox::schemas();
    if json {
        println!("{}", serde_json::to_string_pretty(&schemas)?);
        return Ok(());
    }

    println!();
    println!("🔧 Navigation tools ({} total)", ToolName::ALL.len());
    println!();
    for tool in ToolName::ALL {
        println!("  {:<22} {}", tool.as_str(), tool.description());
        let params = tool.parameters();
        let required: Vec<&str> = params
            .get("required")
            .and_then(|r| r.as_array())
            .map(|arr| arr.iter().filter_map(|v| v.as_str()).collect())
            .unwrap_or_default();
        if let Some(props) = params.get("properties").and_then(|p| p.as_object()) {
            for (name, schema) in props {
                let ty = schema.get("type").and_then(|t| t.as_str()).unwrap_or("any");
                let marker = if required.contains(&name.as_str()) { "*" } else { " " };
                println!("     {}{:<14} {}", marker, name, ty);
            }
        }
        println!();
    }
    Ok(())
}

/// Run one tool against a fresh browser session, bypassing the model.
pub async fn run(override_path: Option<&Path>, tool_name: &str, params_json: &str) -> anyhow::Result<()> {
    if ToolName::parse(tool_name).is_none() {
        anyhow::bail!(
            "Tool '{}' not found. Use `paynav tools` to see available tools.",
            tool_name
        );
    }

    let paths = Paths::new();
    let config = super::load_config(&paths, override_path)?;
    let launcher = Arc::new(ChromeLauncher::new(
        config.browser.clone(),
        paths.browser_profiles_dir(),
    ));
    let mut toolbox = Toolbox::new(launcher, &config);

    let output = toolbox.dispatch(tool_name, params_json).await;
    toolbox.cleanup().await;

    let value: serde_json::Value = serde_json::from_str(&output.text)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    if !output.ok {
        std::process::exit(1);
    }
    Ok(())
}
