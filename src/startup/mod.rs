use std::fs;
use std::path::{Path, PathBuf};

/// Installs or removes a per-user launchd agent that starts this executable
/// at login.
pub fn set_autostart(app_name: &str, enable: bool) -> Result<(), Box<dyn std::error::Error>> {
    let home = std::env::var("HOME").map_err(|_| "HOME is not set")?;
    let agents = Path::new(&home).join("Library").join("LaunchAgents");
    let exe = std::env::current_exe()?;
    set_autostart_in(&agents, app_name, &exe, enable)
}

fn set_autostart_in(
    agents_dir: &Path,
    app_name: &str,
    exe: &Path,
    enable: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let plist = plist_path(agents_dir, app_name);
    if enable {
        fs::create_dir_all(agents_dir)?;
        fs::write(&plist, launch_agent_plist(&label(app_name), exe))?;
        tracing::info!("Installed launch agent {}", plist.display());
    } else if plist.exists() {
        fs::remove_file(&plist)?;
        tracing::info!("Removed launch agent {}", plist.display());
    }
    Ok(())
}

fn label(app_name: &str) -> String {
    let slug: String = app_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect::<String>()
        .to_lowercase();
    format!("com.{}.agent", if slug.is_empty() { "mac2mqtt" } else { &slug })
}

fn plist_path(agents_dir: &Path, app_name: &str) -> PathBuf {
    agents_dir.join(format!("{}.plist", label(app_name)))
}

fn launch_agent_plist(label: &str, exe: &Path) -> String {
    let workdir = exe
        .parent()
        .map(|p| xml_escape(&p.to_string_lossy()))
        .unwrap_or_else(|| "/".to_string());
    let exe = xml_escape(&exe.to_string_lossy());
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>{label}</string>
    <key>ProgramArguments</key>
    <array>
        <string>{exe}</string>
    </array>
    <key>WorkingDirectory</key>
    <string>{workdir}</string>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <true/>
</dict>
</plist>
"#
    )
}

fn xml_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
