//! Embedded resource bundle, addressed by path like a read-only filesystem.

static ASSETS: &[(&str, &[u8])] = &[(
    "detmap/dev.json",
    include_bytes!("../assets/detmap/dev.json"),
)];

pub fn find(path: &str) -> Option<&'static [u8]> {
    ASSETS
        .iter()
        .find(|(name, _)| *name == path)
        .map(|(_, bytes)| *bytes)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn embedded_detmap_is_present() {
        assert!(find("detmap/dev.json").is_some());
        assert!(find("detmap/missing.json").is_none());
    }
}
