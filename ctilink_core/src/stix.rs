//! Small STIX helpers shared by connectors.

use chrono::{SecondsFormat, Utc};

/// Platform entity type for a STIX cyber-observable type, `"Unknown"` otherwise.
pub fn stix_observable_opencti_type(observable_type: &str) -> &'static str {
    match observable_type {
        "autonomous-system" => "Autonomous-System",
        "directory" => "Directory",
        "domain-name" => "Domain-Name",
        "email-addr" => "Email-Addr",
        "file" => "StixFile",
        "email-message" => "Email-Message",
        "ipv4-addr" => "IPv4-Addr",
        "ipv6-addr" => "IPv6-Addr",
        "mac-addr" => "Mac-Addr",
        "mutex" => "Mutex",
        "network-traffic" => "Network-Traffic",
        "process" => "Process",
        "software" => "Software",
        "url" => "Url",
        "user-account" => "User-Account",
        "windows-registry-key" => "Windows-Registry-Key",
        "windows-registry-value-type" => "Windows-Registry-Value-Type",
        "x-opencti-hostname" => "X-OpenCTI-Hostname",
        _ => "Unknown",
    }
}

fn pattern_path(observable_key: &str) -> Option<&'static [&'static str]> {
    let path: &'static [&'static str] = match observable_key {
        "Autonomous-System" => &["number"],
        "Directory" => &["path"],
        "Domain-Name" => &["value"],
        "Email-Addr" => &["value"],
        "File_md5" => &["hashes", "MD5"],
        "File_sha1" => &["hashes", "SHA-1"],
        "File_sha256" => &["hashes", "SHA-256"],
        "File_sha512" => &["hashes", "SHA-512"],
        "Email-Message_Body" => &["body"],
        "Email-Message_Subject" => &["subject"],
        "Email-Mime-Part-Type" => &["body"],
        "IPv4-Addr" => &["value"],
        "IPv6-Addr" => &["value"],
        "Mac-Addr" => &["value"],
        "Mutex" => &["name"],
        "Network-Traffic" => &["dst_port"],
        "Process" => &["pid"],
        "Software" => &["name"],
        "Url" => &["value"],
        "User-Account" => &["acount_login"],
        "Windows-Registry-Key" => &["key"],
        "Windows-Registry-Value-Type" => &["name"],
        "X-OpenCTI-Hostname" => &["value"],
        _ => return None,
    };
    Some(path)
}

const INTEGER_VALUED: [&str; 3] = [
    "Autonomous-System.number",
    "Network-Traffic.dst_port",
    "Process.pid",
];

/// Builds an equality STIX pattern for an observable key and value.
///
/// `observable_key` is a platform observable type, optionally suffixed with
/// the hash or field it targets (`File_sha256`). Returns `None` for keys
/// without a known object path.
pub fn create_stix_pattern(observable_key: &str, value: &str) -> Option<String> {
    let path = pattern_path(observable_key)?;
    let object_type = observable_key
        .split('_')
        .next()
        .unwrap_or(observable_key)
        .to_ascii_lowercase();

    let property = path
        .iter()
        .map(|p| {
            if p.contains('-') {
                format!("'{p}'")
            } else {
                (*p).to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(".");

    let integer_field = INTEGER_VALUED.contains(&format!("{observable_key}.{}", path[0]).as_str());
    let literal = match value.trim().parse::<i64>() {
        Ok(n) if integer_field => n.to_string(),
        _ => format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'")),
    };

    Some(format!("[{object_type}:{property} = {literal}]"))
}

/// A random STIX id (`<type>--<uuid v1>`) for objects the platform will
/// resolve on its own.
pub fn generate_random_stix_id(stix_type: &str) -> String {
    let node_id: [u8; 6] = rand::random();
    format!("{stix_type}--{}", uuid::Uuid::now_v1(&node_id))
}

/// Current UTC time in RFC 3339, seconds precision.
pub fn date_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, false)
}
