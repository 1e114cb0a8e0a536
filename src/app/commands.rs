//! Inbound operator commands.
//!
//! Parsed from a `name` or `name=value` console line; transports (serial
//! console, future network surfaces) construct these and hand them to
//! [`crate::app::service::ControlLoop::handle_command`].

/// One operator request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Begin an I-V sweep now.
    StartSweep,
    /// Re-open the link to the supply.
    ReconnectPsu,
    /// Report the recent-collapse count.
    GetCollapses,
    /// Configure (or with an empty spec, report) low-voltage protection.
    /// Spec format: `pin[i]:trigger:recovery`.
    SetLvProtect(String),
    /// Replace (or with an empty spec, report) the supply driver, by
    /// device-class name.
    SetPsu(String),
    /// Read a published field by name.
    Get(String),
    /// Write a config field by name.
    Set(String, String),
}

impl Command {
    /// Parse a console line: bare words are getters or verbs,
    /// `name=value` is a setter.
    pub fn parse(line: &str) -> Option<Command> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if let Some((name, value)) = line.split_once('=') {
            let (name, value) = (name.trim(), value.trim());
            return Some(match name {
                "lvprotect" => Command::SetLvProtect(value.to_owned()),
                "psu" => Command::SetPsu(value.to_owned()),
                _ => Command::Set(name.to_owned(), value.to_owned()),
            });
        }
        Some(match line {
            "sweep" => Command::StartSweep,
            "connect" => Command::ReconnectPsu,
            "collapses" => Command::GetCollapses,
            "lvprotect" => Command::SetLvProtect(String::new()),
            "psu" => Command::SetPsu(String::new()),
            name => Command::Get(name.to_owned()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_verbs_getters_setters() {
        assert_eq!(Command::parse("sweep"), Some(Command::StartSweep));
        assert_eq!(Command::parse("collapses"), Some(Command::GetCollapses));
        assert_eq!(
            Command::parse("pgain = 0.2"),
            Some(Command::Set("pgain".into(), "0.2".into()))
        );
        assert_eq!(
            Command::parse("involt"),
            Some(Command::Get("involt".into()))
        );
        assert_eq!(
            Command::parse("lvprotect=22:11.8"),
            Some(Command::SetLvProtect("22:11.8".into()))
        );
        assert_eq!(
            Command::parse("lvprotect"),
            Some(Command::SetLvProtect(String::new()))
        );
        assert_eq!(Command::parse("connect"), Some(Command::ReconnectPsu));
        assert_eq!(
            Command::parse("psu=dps"),
            Some(Command::SetPsu("dps".into()))
        );
        assert_eq!(Command::parse("psu"), Some(Command::SetPsu(String::new())));
        assert_eq!(Command::parse("   "), None);
    }
}
