//! Bracketed datastore-path notation.
//!
//! The management server addresses files as `[datacenter][datastore] rel/path`
//! or `[datastore] rel/path` when the datacenter is implicit. The exact
//! bracket and space grammar must be preserved because the server echoes these
//! paths back and expects them unchanged.

use std::sync::LazyLock;

use regex::Regex;

/// Datacenter assumed when a path carries only one bracket group. Standalone
/// hosts report this pseudo-datacenter for everything they own.
pub const DEFAULT_DATACENTER: &str = "ha-datacenter";

static VM_PATH_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[(.*)\](\[.*)").expect("vm path pattern is valid"));

/// A full VM path split into its datacenter and datastore-path parts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedVmPath {
    /// Datacenter the path belongs to.
    pub datacenter: String,
    /// Remaining `[datastore] rel/path` portion, brackets included.
    pub datastore_path: String,
    /// `false` when the input did not match the two-bracket grammar and the
    /// datacenter fell back to [`DEFAULT_DATACENTER`].
    pub exact: bool,
}

/// Split a full VM path into datacenter and datastore path.
///
/// Unparseable input falls back to the default datacenter with the input
/// passed through untouched; `exact` records which way the split went.
#[must_use]
pub fn parse_vm_path(full_path: &str) -> ParsedVmPath {
    match VM_PATH_PATTERN.captures(full_path) {
        Some(captures) => ParsedVmPath {
            datacenter: captures[1].to_string(),
            datastore_path: captures[2].to_string(),
            exact: true,
        },
        None => ParsedVmPath {
            datacenter: DEFAULT_DATACENTER.to_string(),
            datastore_path: full_path.to_string(),
            exact: false,
        },
    }
}

/// Addressable location of a file on a datastore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileUrl {
    /// Download URL without query parameters.
    pub url: String,
    /// Datacenter, sent as the `dcPath` query parameter.
    pub datacenter: String,
    /// Datastore name, sent as the `dsName` query parameter.
    pub datastore: String,
}

/// Build the download URL for a `[datastore] rel/path` file reference.
///
/// The datastore name is the text inside the first bracket group; the
/// relative path is everything after the closing bracket and its separator
/// space. No percent-encoding is applied; the server hands out these paths
/// itself, so they are already transport-safe. A `server` value carrying an
/// explicit scheme is used as-is, otherwise `https` is assumed.
#[must_use]
pub fn build_file_url(server: &str, datastore_path: &str, datacenter: &str) -> FileUrl {
    let (datastore, relative_path) = match datastore_path.find(']') {
        Some(end) => {
            let start = datastore_path.find('[').map_or(0, |open| open + 1);
            let datastore = &datastore_path[start..end];
            // one separator character follows the closing bracket
            let relative = datastore_path
                .get(end + 2..)
                .unwrap_or_default();
            (datastore, relative)
        }
        None => ("", datastore_path),
    };

    let url = if server.contains("://") {
        format!("{server}/folder/{relative_path}")
    } else {
        format!("https://{server}/folder/{relative_path}")
    };

    FileUrl {
        url,
        datacenter: datacenter.to_string(),
        datastore: datastore.to_string(),
    }
}

/// Final path segment of a URL, used to name the local copy of a download.
#[must_use]
pub fn file_name_from_url(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_bracket_paths_split_exactly() {
        let parsed = parse_vm_path("[Datacenter][DAS_labesxi1_1] OpenVAS/OpenVAS.vmx");
        assert_eq!(parsed.datacenter, "Datacenter");
        assert_eq!(parsed.datastore_path, "[DAS_labesxi1_1] OpenVAS/OpenVAS.vmx");
        assert!(parsed.exact);
    }

    #[test]
    fn single_bracket_paths_fall_back_to_default_datacenter() {
        let parsed = parse_vm_path("[datastore1] WXP3x86/WXP3x86.vmx");
        assert_eq!(parsed.datacenter, DEFAULT_DATACENTER);
        assert_eq!(parsed.datastore_path, "[datastore1] WXP3x86/WXP3x86.vmx");
        assert!(!parsed.exact);
    }

    #[test]
    fn garbage_input_passes_through_inexactly() {
        let parsed = parse_vm_path("no brackets here");
        assert_eq!(parsed.datacenter, DEFAULT_DATACENTER);
        assert_eq!(parsed.datastore_path, "no brackets here");
        assert!(!parsed.exact);
    }

    #[test]
    fn file_url_reconstructs_folder_path() {
        let file_url = build_file_url(
            "esx.example",
            "[datastore1] WXP3x86/WXP3x86-Snapshot2.vmem",
            "ha-datacenter",
        );
        assert_eq!(
            file_url.url,
            "https://esx.example/folder/WXP3x86/WXP3x86-Snapshot2.vmem"
        );
        assert_eq!(file_url.datastore, "datastore1");
        assert_eq!(file_url.datacenter, "ha-datacenter");
    }

    #[test]
    fn explicit_scheme_is_preserved() {
        let file_url = build_file_url("http://127.0.0.1:8080", "[ds] a/b.vmsd", "dc");
        assert_eq!(file_url.url, "http://127.0.0.1:8080/folder/a/b.vmsd");
    }

    #[test]
    fn url_file_name_is_last_segment() {
        assert_eq!(
            file_name_from_url("https://esx.example/folder/WXP3x86/WXP3x86.vmsd"),
            "WXP3x86.vmsd"
        );
    }
}
