//! Stable machine identifier sent with assertion exchanges.
//!
//! Linux reads `/etc/machine-id`, macOS the `IOPlatformUUID` reported by
//! `ioreg`, Windows the `Win32_ComputerSystemProduct` UUID. The host name is
//! the fallback everywhere.

use std::fs;
use std::path::Path;

#[cfg(not(any(target_os = "macos", windows)))]
const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// Identifier of this machine, sent as `device_id` on exchange.
pub fn device_id() -> Option<String> {
    platform_id().or_else(host_name)
}

#[cfg(not(any(target_os = "macos", windows)))]
fn platform_id() -> Option<String> {
    read_machine_id(Path::new(MACHINE_ID_PATH))
}

#[cfg(target_os = "macos")]
fn platform_id() -> Option<String> {
    let stdout = command_stdout("ioreg", &["-rd1", "-c", "IOPlatformExpertDevice"])?;
    parse_ioreg_uuid(&stdout)
}

#[cfg(windows)]
fn platform_id() -> Option<String> {
    let stdout = command_stdout(
        "powershell",
        &[
            "-NoProfile",
            "-Command",
            "(Get-CimInstance -ClassName Win32_ComputerSystemProduct).UUID",
        ],
    )?;
    parse_product_uuid(&stdout)
}

#[cfg(any(target_os = "macos", windows))]
fn command_stdout(program: &str, args: &[&str]) -> Option<String> {
    match std::process::Command::new(program).args(args).output() {
        Ok(output) if output.status.success() => String::from_utf8(output.stdout).ok(),
        Ok(output) => {
            tracing::debug!(program, status = %output.status, "device id command failed");
            None
        }
        Err(e) => {
            tracing::debug!(program, error = %e, "device id command unavailable");
            None
        }
    }
}

#[cfg_attr(any(target_os = "macos", windows), allow(dead_code))]
fn read_machine_id(path: &Path) -> Option<String> {
    let content = fs::read_to_string(path).ok()?;
    let id = content.trim();
    (!id.is_empty()).then(|| id.to_string())
}

/// Extracts the value of `"IOPlatformUUID" = "..."` from `ioreg` output.
#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn parse_ioreg_uuid(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.contains("\"IOPlatformUUID\""))
        .and_then(|line| line.split('=').nth(1))
        .map(|value| value.trim().trim_matches('"').to_string())
        .filter(|uuid| !uuid.is_empty())
}

/// First non-blank line that is not a column header. The all-zero and
/// all-F UUIDs some firmware reports are not identifiers.
#[cfg_attr(not(windows), allow(dead_code))]
fn parse_product_uuid(output: &str) -> Option<String> {
    output
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.eq_ignore_ascii_case("uuid"))
        .filter(|uuid| {
            !uuid
                .chars()
                .filter(|c| *c != '-')
                .all(|c| c == '0' || c.eq_ignore_ascii_case(&'f'))
        })
        .map(str::to_string)
}

fn host_name() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_id_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine-id");
        fs::write(&path, "3f2a9c0d1e\n").unwrap();
        assert_eq!(read_machine_id(&path).as_deref(), Some("3f2a9c0d1e"));
    }

    #[test]
    fn test_missing_or_blank_machine_id() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_machine_id(&dir.path().join("missing")).is_none());

        let blank = dir.path().join("blank");
        fs::write(&blank, "\n").unwrap();
        assert!(read_machine_id(&blank).is_none());
    }

    #[test]
    fn test_ioreg_platform_uuid() {
        let output = r#"+-o MacBookPro18,3  <class IOPlatformExpertDevice, id 0x100000000>
    {
      "IOPlatformSerialNumber" = "C02XXXXXXX"
      "IOPlatformUUID" = "6A1E2B3C-4D5E-6F70-8192-A3B4C5D6E7F8"
      "manufacturer" = <"Apple Inc.">
    }
"#;
        assert_eq!(
            parse_ioreg_uuid(output).as_deref(),
            Some("6A1E2B3C-4D5E-6F70-8192-A3B4C5D6E7F8")
        );
        assert!(parse_ioreg_uuid("+-o Root\n").is_none());
    }

    #[test]
    fn test_product_uuid() {
        assert_eq!(
            parse_product_uuid("\r\n4C4C4544-0048-3510-8052-B7C04F4A4E32\r\n").as_deref(),
            Some("4C4C4544-0048-3510-8052-B7C04F4A4E32")
        );
        assert_eq!(
            parse_product_uuid("UUID\r\n4C4C4544-0048-3510-8052-B7C04F4A4E32\r\n").as_deref(),
            Some("4C4C4544-0048-3510-8052-B7C04F4A4E32")
        );
        assert!(parse_product_uuid("00000000-0000-0000-0000-000000000000").is_none());
        assert!(parse_product_uuid("FFFFFFFF-FFFF-FFFF-FFFF-FFFFFFFFFFFF").is_none());
        assert!(parse_product_uuid("\r\n").is_none());
    }
}
