//! Local name syntax rules, checked before any remote name probe.

/// Naming rule families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameRule {
    /// SQL / MySQL servers: 1-63 of `[a-z0-9-]`, no leading/trailing hyphen.
    Server,
    /// Storage accounts: 3-24 of `[a-z0-9]`.
    StorageAccount,
    /// Cosmos DB accounts: 3-44 of `[a-z0-9-]`.
    CosmosAccount,
    /// Children of a server (databases, rules, administrators).
    Child,
}

const CHILD_FORBIDDEN: &[char] = &['<', '>', '*', '%', '&', ':', '\\', '/', '?'];

fn lower_alnum(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit()
}

fn length(name: &str, min: usize, max: usize) -> Result<(), String> {
    let len = name.chars().count();
    if len < min || len > max {
        return Err(format!("length must be between {min} and {max}, got {len}"));
    }
    Ok(())
}

/// Validate `name` against `rule`, returning a human-readable reason.
pub fn check(rule: NameRule, name: &str) -> Result<(), String> {
    match rule {
        NameRule::Server | NameRule::CosmosAccount => {
            let (min, max) = if rule == NameRule::Server { (1, 63) } else { (3, 44) };
            length(name, min, max)?;
            if let Some(c) = name.chars().find(|&c| !(lower_alnum(c) || c == '-')) {
                return Err(format!(
                    "invalid character {c:?}: only lowercase letters, digits and hyphens are allowed"
                ));
            }
            if name.starts_with('-') || name.ends_with('-') {
                return Err("must not start or end with a hyphen".to_string());
            }
        }
        NameRule::StorageAccount => {
            length(name, 3, 24)?;
            if let Some(c) = name.chars().find(|&c| !lower_alnum(c)) {
                return Err(format!(
                    "invalid character {c:?}: only lowercase letters and digits are allowed"
                ));
            }
        }
        NameRule::Child => {
            length(name, 1, 128)?;
            if let Some(c) = name.chars().find(|c| CHILD_FORBIDDEN.contains(c)) {
                return Err(format!("invalid character {c:?}"));
            }
            if name.ends_with('.') || name.ends_with(' ') {
                return Err("must not end with a period or space".to_string());
            }
        }
    }
    Ok(())
}
