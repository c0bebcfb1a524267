//! Devicetree pipeline: preprocess, parse, extract

pub mod model;
pub mod parse;
pub mod preprocess;
pub mod spi;

use std::{collections::BTreeSet, io, path};

use fs_err as fs;

use crate::dts::model::Devicetree;

/// Load vendor prefix files (`<prefix><TAB><vendor name>` lines, `#`
/// comments), merging them into one set
pub fn load_vendor_prefixes(paths: &[path::PathBuf]) -> io::Result<BTreeSet<String>> {
    let mut prefixes = BTreeSet::new();
    for path in paths {
        let text = fs::read_to_string(path)?;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some(prefix) = line.split_whitespace().next() {
                prefixes.insert(prefix.to_owned());
            }
        }
    }
    Ok(prefixes)
}

/// Check every node's `compatible` vendor prefix against `prefixes`,
/// returning one message per unknown prefix
///
/// With no prefixes loaded the check is skipped entirely.
pub fn check_vendor_prefixes(dt: &Devicetree, prefixes: &BTreeSet<String>) -> Vec<String> {
    if prefixes.is_empty() {
        return Vec::new();
    }
    let mut warnings = Vec::new();
    for id in dt.live_ids() {
        for compatible in dt.compatibles(id) {
            if let Some((vendor, _)) = compatible.split_once(',') {
                if !prefixes.contains(vendor) {
                    warnings.push(format!(
                        "node {}: unknown vendor prefix {vendor:?} in compatible {compatible:?}",
                        dt.path(id)
                    ));
                }
            }
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dts::parse::parse_dts;

    #[test]
    fn unknown_vendor_prefixes_are_reported() {
        let dt = parse_dts(
            r#"/ { a { compatible = "acme,imu"; }; b { compatible = "nonesuch,mag"; }; };"#,
        )
        .unwrap();
        let prefixes: BTreeSet<String> = ["acme".to_owned()].into_iter().collect();
        let warnings = check_vendor_prefixes(&dt, &prefixes);
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("nonesuch"));
    }

    #[test]
    fn empty_prefix_set_skips_the_check() {
        let dt = parse_dts(r#"/ { a { compatible = "acme,imu"; }; };"#).unwrap();
        assert!(check_vendor_prefixes(&dt, &BTreeSet::new()).is_empty());
    }

    #[test]
    fn generic_compatibles_have_no_vendor_to_check() {
        let dt = parse_dts(r#"/ { a { compatible = "simple-bus"; }; };"#).unwrap();
        let prefixes: BTreeSet<String> = ["acme".to_owned()].into_iter().collect();
        assert!(check_vendor_prefixes(&dt, &prefixes).is_empty());
    }
}
