// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Stateless predicate deciding whether a stream is a "system sound"
//! (notification, alert, shell bell) for default placement on the system
//! bus.

use std::collections::HashMap;

const KNOWN_APPS: &[&str] = &[
    "gnome-shell",
    "plasmashell",
    "kded5",
    "kded6",
    "xfce4-notifyd",
    "notification-daemon",
    "mako",
];

const KNOWN_BINARIES_EXTRA: &[&str] = &["canberra-gtk-play"];

const NAME_SUBSTRINGS: &[&str] = &[
    "system sound",
    "system sounds",
    "systemklänge",
    "benachrichtigung",
    "notification",
    "event",
];

fn lower<'a>(props: &'a HashMap<String, String>, key: &str) -> Option<String> {
    props.get(key).map(|v| v.to_lowercase())
}

/// Evaluate whether a stream's property bag marks it as a system sound.
pub fn is_system_stream(props: &HashMap<String, String>) -> bool {
    if let Some(role) = lower(props, "media.role") {
        if role == "event" || role == "notification" {
            return true;
        }
    }

    if let Some(app) = lower(props, "application.name") {
        if KNOWN_APPS.contains(&app.as_str()) {
            return true;
        }
    }

    if let Some(binary) = lower(props, "application.process.binary") {
        if KNOWN_APPS.contains(&binary.as_str()) || KNOWN_BINARIES_EXTRA.contains(&binary.as_str())
        {
            return true;
        }
    }

    if let Some(app_id) = lower(props, "pipewire.access.portal.app_id") {
        if app_id.starts_with("org.freedesktop.impl.portal") {
            if let Some(media_name) = lower(props, "media.name") {
                if media_name.contains("portal") {
                    return true;
                }
            }
        }
    }

    if let Some(media_name) = lower(props, "media.name") {
        if NAME_SUBSTRINGS.iter().any(|s| media_name.contains(s)) {
            return true;
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn matches_event_role() {
        assert!(is_system_stream(&props(&[("media.role", "event")])));
    }

    #[test]
    fn matches_german_media_name() {
        assert!(is_system_stream(&props(&[(
            "media.name",
            "GNOME Systemklänge"
        )])));
    }

    #[test]
    fn matches_portal_app_id_with_portal_in_name() {
        assert!(is_system_stream(&props(&[
            (
                "pipewire.access.portal.app_id",
                "org.freedesktop.impl.portal.Notification"
            ),
            ("media.name", "xdg-desktop-portal notification")
        ])));
    }

    #[test]
    fn portal_app_id_alone_is_not_enough() {
        assert!(!is_system_stream(&props(&[(
            "pipewire.access.portal.app_id",
            "org.freedesktop.impl.portal.FileChooser"
        ),
        (
            "media.name",
            "Open File"
        )])));
    }

    #[test]
    fn ordinary_stream_does_not_match() {
        assert!(!is_system_stream(&props(&[
            ("application.name", "Firefox"),
            ("media.name", "Playback")
        ])));
    }
}
