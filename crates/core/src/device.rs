//! Human-readable device titles derived from `User-Agent` headers.
//!
//! Titles take the shape `"<Browser> <Version> on <OS>"`. Unrecognised parts
//! fall back to `Unknown browser` / `Unknown OS`.

use std::fmt;

pub const UNKNOWN_BROWSER: &str = "Unknown browser";
pub const UNKNOWN_OS: &str = "Unknown OS";

/// Browser markers checked in order. Chromium derivatives advertise `Chrome/`
/// and `Safari/` too, so they must come before the generic entries.
const BROWSER_MARKERS: &[(&str, &str)] = &[
    ("Edg/", "Edge"),
    ("EdgA/", "Edge"),
    ("EdgiOS/", "Edge"),
    ("Edge/", "Edge"),
    ("OPR/", "Opera"),
    ("Opera/", "Opera"),
    ("YaBrowser/", "Yandex"),
    ("SamsungBrowser/", "Samsung Browser"),
    ("Vivaldi/", "Vivaldi"),
    ("FxiOS/", "Firefox"),
    ("Firefox/", "Firefox"),
    ("CriOS/", "Chrome"),
    ("Chromium/", "Chromium"),
    ("Chrome/", "Chrome"),
];

/// Operating system markers checked in order. iOS and Android UAs also mention
/// `Mac OS X` and `Linux` respectively.
const OS_MARKERS: &[(&str, &str)] = &[
    ("iPhone", "iOS"),
    ("iPad", "iOS"),
    ("iPod", "iOS"),
    ("Android", "Android"),
    ("CrOS", "Chrome OS"),
    ("Windows Phone", "Windows Phone"),
    ("Windows", "Windows"),
    ("Macintosh", "Mac OS"),
    ("Mac OS X", "Mac OS"),
    ("Ubuntu", "Ubuntu"),
    ("Fedora", "Fedora"),
    ("Linux", "Linux"),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Browser {
    pub name: &'static str,
    pub version: Option<String>,
}

/// Parsed browser and operating system of a client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceName {
    pub browser: Option<Browser>,
    pub os: Option<&'static str>,
}

impl DeviceName {
    pub fn parse(user_agent: &str) -> Self {
        Self {
            browser: parse_browser(user_agent),
            os: OS_MARKERS
                .iter()
                .find(|(marker, _)| user_agent.contains(marker))
                .map(|(_, name)| *name),
        }
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.browser {
            Some(Browser {
                name,
                version: Some(version),
            }) => write!(f, "{name} {version}")?,
            Some(Browser {
                name,
                version: None,
            }) => f.write_str(name)?,
            None => f.write_str(UNKNOWN_BROWSER)?,
        }
        write!(f, " on {}", self.os.unwrap_or(UNKNOWN_OS))
    }
}

/// Title stored on a session row for the given `User-Agent` value.
pub fn describe_user_agent(user_agent: Option<&str>) -> String {
    user_agent
        .map(str::trim)
        .filter(|ua| !ua.is_empty())
        .map(DeviceName::parse)
        .unwrap_or_default()
        .to_string()
}

fn parse_browser(user_agent: &str) -> Option<Browser> {
    for (marker, name) in BROWSER_MARKERS {
        if let Some(version) = version_after(user_agent, marker) {
            return Some(Browser {
                name,
                version: Some(version),
            });
        }
    }

    // Safari reports its marketing version under `Version/`.
    if user_agent.contains("Safari/") {
        if let Some(version) = version_after(user_agent, "Version/") {
            return Some(Browser {
                name: "Safari",
                version: Some(version),
            });
        }
    }

    if let Some(version) = version_after(user_agent, "MSIE ") {
        return Some(Browser {
            name: "IE",
            version: Some(version),
        });
    }
    if user_agent.contains("Trident/") {
        return Some(Browser {
            name: "IE",
            version: version_after(user_agent, "rv:"),
        });
    }

    None
}

fn version_after(user_agent: &str, marker: &str) -> Option<String> {
    let start = user_agent.find(marker)? + marker.len();
    let version: String = user_agent[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '.')
        .collect();
    if version.is_empty() {
        None
    } else {
        Some(version)
    }
}
