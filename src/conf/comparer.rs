//! Change classification against the last committed configuration.
//!
//! `update` parses and classifies a candidate without touching the
//! baseline; `commit` promotes the candidate once the caller has acted on
//! it. A failed parse leaves both baseline and last result as they were.

use std::collections::BTreeMap;

use crate::conf::{ConfError, ConfPaths, ConfSnapshot, MainConfSnapshot, ServerConf};

/// Outcome of one `update`. `changed` is the OR of the other two.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ComparisonResult {
    pub changed: bool,
    pub value_changed: bool,
    pub sub_conf_changed: bool,
}

impl ComparisonResult {
    fn new(value_changed: bool, sub_conf_changed: bool) -> Self {
        Self {
            changed: value_changed || sub_conf_changed,
            value_changed,
            sub_conf_changed,
        }
    }
}

#[derive(Debug)]
pub struct Comparer {
    paths: ConfPaths,
    committed: Option<ServerConf>,
    candidate: Option<ServerConf>,
    last: ComparisonResult,
}

impl Comparer {
    pub fn new(paths: ConfPaths) -> Self {
        Self {
            paths,
            committed: None,
            candidate: None,
            last: ComparisonResult::default(),
        }
    }

    /// Classify `main` + `subs` against the committed baseline. With no
    /// baseline yet, everything counts as changed.
    pub fn update(
        &mut self,
        main: &[u8],
        subs: &BTreeMap<String, Vec<u8>>,
    ) -> Result<ComparisonResult, ConfError> {
        let main_path = self.paths.main();
        let main = MainConfSnapshot::parse(&main_path, self.paths.server_type, main)?;

        for (name, data) in subs {
            if data.is_empty() {
                continue;
            }
            if let Err(source) = serde_json::from_slice::<serde_json::Value>(data) {
                return Err(ConfError::Parse { path: self.paths.sub(name), source });
            }
        }

        let result = match &self.committed {
            None => ComparisonResult::new(true, true),
            Some(base) => ComparisonResult::new(base.main.binding != main.binding, &base.subs != subs),
        };

        self.candidate = Some(ServerConf {
            server_type: self.paths.server_type,
            main,
            subs: subs.clone(),
        });
        self.last = result;
        Ok(result)
    }

    /// `update` from a watcher snapshot; a missing main node is an error.
    pub fn update_snapshot(&mut self, snapshot: &ConfSnapshot) -> Result<ComparisonResult, ConfError> {
        let main = snapshot
            .main
            .as_deref()
            .ok_or_else(|| ConfError::MissingMain(self.paths.main()))?;
        self.update(main, &snapshot.subs)
    }

    /// Promote the last candidate to baseline.
    pub fn commit(&mut self) -> Option<&ServerConf> {
        if let Some(candidate) = self.candidate.take() {
            self.committed = Some(candidate);
        }
        self.committed.as_ref()
    }

    /// Drop the pending candidate without committing it.
    pub fn discard(&mut self) {
        self.candidate = None;
    }

    pub fn candidate(&self) -> Option<&ServerConf> {
        self.candidate.as_ref()
    }

    pub fn committed(&self) -> Option<&ServerConf> {
        self.committed.as_ref()
    }

    pub fn result(&self) -> ComparisonResult {
        self.last
    }

    pub fn is_changed(&self) -> bool {
        self.last.changed
    }

    pub fn is_value_changed(&self) -> bool {
        self.last.value_changed
    }

    pub fn is_sub_conf_changed(&self) -> bool {
        self.last.sub_conf_changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::ServerType;

    fn comparer() -> Comparer {
        Comparer::new(ConfPaths::new("p", "s", "c", ServerType::Api))
    }

    fn subs(entries: &[(&str, &str)]) -> BTreeMap<String, Vec<u8>> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn test_first_update_is_changed() {
        let mut c = comparer();
        let r = c.update(br#"{"address":":8080"}"#, &BTreeMap::new()).unwrap();
        assert!(r.changed && r.value_changed && r.sub_conf_changed);
        assert!(c.committed().is_none());
        c.commit();
        assert!(c.committed().is_some());
    }

    #[test]
    fn test_address_change_is_value_change() {
        let mut c = comparer();
        c.update(br#"{"address":":8080"}"#, &BTreeMap::new()).unwrap();
        c.commit();

        let r = c.update(br#"{"address":":9090"}"#, &BTreeMap::new()).unwrap();
        assert!(r.value_changed);
        assert!(!r.sub_conf_changed);
        assert!(c.is_changed());
    }

    #[test]
    fn test_cosmetic_fields_ignored() {
        let mut c = comparer();
        c.update(br#"{"address":":8080","name":"a"}"#, &BTreeMap::new()).unwrap();
        c.commit();

        // Defaults count: an explicit default equals an omitted field.
        let r = c.update(br#"{"name":"b","rTimeout":30}"#, &BTreeMap::new()).unwrap();
        assert!(!r.changed);
        assert!(!c.is_changed());
    }

    #[test]
    fn test_sub_conf_changes() {
        let mut c = comparer();
        let main = br#"{"address":":8080"}"#;
        c.update(main, &subs(&[("router", r#"{"routers":[]}"#)])).unwrap();
        c.commit();

        let r = c.update(main, &subs(&[("router", r#"{"routers":[{"path":"/a"}]}"#)])).unwrap();
        assert!(r.sub_conf_changed && !r.value_changed && r.changed);

        let r = c.update(main, &subs(&[("router", r#"{"routers":[]}"#), ("header", "{}")])).unwrap();
        assert!(r.sub_conf_changed);

        let r = c.update(main, &BTreeMap::new()).unwrap();
        assert!(r.sub_conf_changed);

        let r = c.update(main, &subs(&[("router", r#"{"routers":[]}"#)])).unwrap();
        assert!(!r.changed);
    }

    #[test]
    fn test_update_does_not_rebase() {
        let mut c = comparer();
        c.update(br#"{"address":":8080"}"#, &BTreeMap::new()).unwrap();
        c.commit();

        c.update(br#"{"address":":9090"}"#, &BTreeMap::new()).unwrap();
        let r = c.update(br#"{"address":":9090"}"#, &BTreeMap::new()).unwrap();
        assert!(r.value_changed, "uncommitted candidate must not become the baseline");
    }

    #[test]
    fn test_parse_error_keeps_state() {
        let mut c = comparer();
        c.update(br#"{"address":":8080"}"#, &BTreeMap::new()).unwrap();
        c.commit();
        c.update(br#"{"address":":9090"}"#, &BTreeMap::new()).unwrap();

        assert!(c.update(b"{broken", &BTreeMap::new()).is_err());
        assert!(c.is_value_changed());
        assert!(matches!(
            c.update(br#"{}"#, &subs(&[("router", "nope")])),
            Err(ConfError::Parse { .. })
        ));
        assert_eq!(c.committed().unwrap().binding().address, ":8080");
    }

    #[test]
    fn test_missing_main() {
        let mut c = comparer();
        let snapshot = ConfSnapshot::default();
        assert!(matches!(c.update_snapshot(&snapshot), Err(ConfError::MissingMain(_))));
    }
}
