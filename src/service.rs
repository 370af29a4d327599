use clipmesh_core::Result;

/// XML escape utility for plist generation.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn plist_contents(exe: &str, port: u16, peers: &str, poll: u64) -> String {
    let mut args = vec![
        xml_escape(exe),
        "--port".to_string(),
        port.to_string(),
        "--poll".to_string(),
        poll.to_string(),
    ];
    if !peers.is_empty() {
        args.push("--peers".to_string());
        args.push(xml_escape(peers));
    }

    let arg_strings: String = args
        .iter()
        .map(|a| format!("        <string>{}</string>\n", a))
        .collect();

    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key>
    <string>com.clipmesh.daemon</string>
    <key>ProgramArguments</key>
    <array>
{}    </array>
    <key>RunAtLoad</key>
    <true/>
    <key>KeepAlive</key>
    <true/>
</dict>
</plist>
"#,
        arg_strings
    )
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn unit_contents(exe: &str, port: u16, peers: &str, poll: u64) -> String {
    let mut exec = format!("{} --port {} --poll {}", exe, port, poll);
    if !peers.is_empty() {
        exec.push_str(&format!(" --peers \"{}\"", peers));
    }

    format!(
        r#"[Unit]
Description=Clipmesh clipboard sync daemon
After=network.target

[Service]
Type=simple
ExecStart={}
Restart=always
RestartSec=5

[Install]
WantedBy=default.target
"#,
        exec
    )
}

#[cfg(unix)]
fn set_file_permissions(path: &std::path::Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = std::fs::Permissions::from_mode(mode);
    std::fs::set_permissions(path, permissions)?;
    Ok(())
}

/// Writes the macOS LaunchAgent plist and prints load instructions.
#[cfg(target_os = "macos")]
pub fn generate_autostart(port: u16, peers: &str, poll: u64) -> Result<()> {
    use clipmesh_core::ClipError;

    let current_exe = std::env::current_exe()?;
    let home_dir = dirs::home_dir()
        .ok_or_else(|| ClipError::Other("could not find home directory".to_string()))?;

    let plist_dir = home_dir.join("Library/LaunchAgents");
    std::fs::create_dir_all(&plist_dir)?;
    set_file_permissions(&plist_dir, 0o755)?;

    let plist_path = plist_dir.join("com.clipmesh.daemon.plist");
    let contents = plist_contents(&current_exe.display().to_string(), port, peers, poll);
    std::fs::write(&plist_path, contents)?;
    set_file_permissions(&plist_path, 0o644)?;

    println!("Wrote launchd plist to: {}", plist_path.display());
    println!();
    println!("To load the service:");
    println!("  launchctl bootstrap gui/$(id -u) {}", plist_path.display());
    println!();
    println!("To unload the service:");
    println!("  launchctl bootout gui/$(id -u)/com.clipmesh.daemon");
    Ok(())
}

/// Writes the systemd user unit and prints enable instructions.
#[cfg(target_os = "linux")]
pub fn generate_autostart(port: u16, peers: &str, poll: u64) -> Result<()> {
    use clipmesh_core::ClipError;

    let current_exe = std::env::current_exe()?;
    let home_dir = dirs::home_dir()
        .ok_or_else(|| ClipError::Other("could not find home directory".to_string()))?;

    let systemd_dir = home_dir.join(".config/systemd/user");
    std::fs::create_dir_all(&systemd_dir)?;
    set_file_permissions(&systemd_dir, 0o755)?;

    let unit_path = systemd_dir.join("clipmesh.service");
    let contents = unit_contents(&current_exe.display().to_string(), port, peers, poll);
    std::fs::write(&unit_path, contents)?;
    set_file_permissions(&unit_path, 0o644)?;

    println!("Wrote systemd user unit to: {}", unit_path.display());
    println!();
    println!("To enable and start the service:");
    println!("  systemctl --user daemon-reload");
    println!("  systemctl --user enable --now clipmesh.service");
    Ok(())
}

#[cfg(not(any(target_os = "macos", target_os = "linux")))]
pub fn generate_autostart(_port: u16, _peers: &str, _poll: u64) -> Result<()> {
    Err(clipmesh_core::ClipError::Other(
        "autostart generation is not supported on this platform".to_string(),
    ))
}
