use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

const MAX_IDENTIFIER_LEN: usize = 64;

/// Failure taxonomy shared by every [`AssociationStore`] implementation.
#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StoreError {
    #[error("connectivity error: {0}")]
    Connectivity(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    #[error("store error: {0}")]
    Other(String),
}

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum LayoutError {
    #[error("invalid identifier for {field}: {value:?}")]
    InvalidIdentifier { field: &'static str, value: String },
    #[error("table name {0:?} is used for more than one role")]
    DuplicateTable(String),
    #[error("join table columns must be distinct, got {0:?} twice")]
    DuplicateColumn(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ParentId(pub i64);

impl Display for ParentId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ChildId(pub i64);

impl Display for ChildId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One (parent, child) association instance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AssociationPair {
    pub parent_id: ParentId,
    pub child_id: ChildId,
}

impl AssociationPair {
    #[must_use]
    pub fn new(parent_id: ParentId, child_id: ChildId) -> Self {
        Self { parent_id, child_id }
    }
}

impl Display for AssociationPair {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.parent_id, self.child_id)
    }
}

/// A parent row with its associated child ids, as returned by one eager fetch.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ParentWithChildren {
    pub id: ParentId,
    pub children: Vec<ChildId>,
}

/// A persisted row of the explicit join table.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct JoinRecord {
    pub id: i64,
    pub parent_id: ParentId,
    pub child_id: ChildId,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

impl JoinRecord {
    #[must_use]
    pub fn pair(&self) -> AssociationPair {
        AssociationPair::new(self.parent_id, self.child_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct CopyReport {
    pub parents_scanned: usize,
    pub parents_without_children: usize,
    pub join_records_written: usize,
}

/// Capabilities the copier needs from the underlying data store.
///
/// Implementations own exactly one connection. `release` consumes the store so
/// the connection cannot be used after it has been closed.
pub trait AssociationStore {
    /// Load every parent with its children in a single eager query.
    ///
    /// Parents are returned in ascending id order, children in ascending id
    /// order within each parent. Parents without children are included.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when the query cannot be executed or decoded.
    fn fetch_parents_with_children(&mut self) -> Result<Vec<ParentWithChildren>, StoreError>;

    /// Insert one join row for `pair`.
    ///
    /// # Errors
    /// Returns [`StoreError::ConstraintViolation`] when the pair already exists
    /// or references a missing parent/child.
    fn insert_join(&mut self, pair: AssociationPair) -> Result<JoinRecord, StoreError>;

    /// Close the underlying connection.
    ///
    /// # Errors
    /// Returns a [`StoreError`] when the connection refuses to close cleanly.
    fn release(self) -> Result<(), StoreError>
    where
        Self: Sized;
}

/// Flatten fetched parents into the ordered list of pairs the copier inserts.
#[must_use]
pub fn plan_associations(parents: &[ParentWithChildren]) -> Vec<AssociationPair> {
    parents
        .iter()
        .flat_map(|parent| {
            parent.children.iter().map(move |child| AssociationPair::new(parent.id, *child))
        })
        .collect()
}

/// Copy every implicit association into the explicit join table.
///
/// The run is a single pass with no transaction around it: when an insert
/// fails, rows written before it stay persisted and the error is returned.
///
/// # Errors
/// Returns the first [`StoreError`] raised by the fetch or by any insert.
pub fn copy_associations<S>(store: &mut S) -> Result<CopyReport, StoreError>
where
    S: AssociationStore + ?Sized,
{
    let parents = store.fetch_parents_with_children()?;
    tracing::info!(parents = parents.len(), "fetched parents with children");

    let mut report = CopyReport {
        parents_scanned: parents.len(),
        parents_without_children: parents.iter().filter(|p| p.children.is_empty()).count(),
        join_records_written: 0,
    };

    for pair in plan_associations(&parents) {
        let record = store.insert_join(pair)?;
        tracing::debug!(join_id = record.id, %pair, "inserted join record");
        report.join_records_written += 1;
    }

    tracing::info!(
        join_records = report.join_records_written,
        parents = report.parents_scanned,
        "association copy complete"
    );
    Ok(report)
}

/// Run [`copy_associations`] and release the store on every exit path.
///
/// A copy error wins over a release error; the latter is only logged in that
/// case.
///
/// # Errors
/// Returns the copy error, or the release error when the copy succeeded.
pub fn run_scoped<S: AssociationStore>(mut store: S) -> Result<CopyReport, StoreError> {
    let outcome = copy_associations(&mut store);
    let released = store.release();

    match (outcome, released) {
        (Ok(report), Ok(())) => Ok(report),
        (Ok(_), Err(err)) | (Err(err), Ok(())) => Err(err),
        (Err(err), Err(release_err)) => {
            tracing::warn!(error = %release_err, "failed to release store after copy error");
            Err(err)
        }
    }
}

/// Table and column names of the implicit relation and the explicit join table.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct RelationLayout {
    pub parent_table: String,
    pub parent_key: String,
    pub child_table: String,
    pub child_key: String,
    pub relation_table: String,
    pub relation_parent_column: String,
    pub relation_child_column: String,
    pub join_table: String,
    pub join_parent_column: String,
    pub join_child_column: String,
}

impl Default for RelationLayout {
    fn default() -> Self {
        Self {
            parent_table: "parents".to_string(),
            parent_key: "id".to_string(),
            child_table: "children".to_string(),
            child_key: "id".to_string(),
            relation_table: "_ParentToChild".to_string(),
            relation_parent_column: "A".to_string(),
            relation_child_column: "B".to_string(),
            join_table: "parent_children".to_string(),
            join_parent_column: "parent_id".to_string(),
            join_child_column: "child_id".to_string(),
        }
    }
}

impl RelationLayout {
    /// Check every name before it is interpolated into SQL.
    ///
    /// # Errors
    /// Returns a [`LayoutError`] for malformed identifiers, a join table that
    /// collides with another table, or join columns that collide.
    pub fn validate(&self) -> Result<(), LayoutError> {
        let fields: [(&'static str, &str); 10] = [
            ("parent_table", &self.parent_table),
            ("parent_key", &self.parent_key),
            ("child_table", &self.child_table),
            ("child_key", &self.child_key),
            ("relation_table", &self.relation_table),
            ("relation_parent_column", &self.relation_parent_column),
            ("relation_child_column", &self.relation_child_column),
            ("join_table", &self.join_table),
            ("join_parent_column", &self.join_parent_column),
            ("join_child_column", &self.join_child_column),
        ];
        for (field, value) in fields {
            if !is_valid_identifier(value) {
                return Err(LayoutError::InvalidIdentifier { field, value: value.to_string() });
            }
        }

        for other in [&self.parent_table, &self.child_table, &self.relation_table] {
            if other.eq_ignore_ascii_case(&self.join_table) {
                return Err(LayoutError::DuplicateTable(self.join_table.clone()));
            }
        }
        if self.relation_table.eq_ignore_ascii_case(&self.parent_table)
            || self.relation_table.eq_ignore_ascii_case(&self.child_table)
        {
            return Err(LayoutError::DuplicateTable(self.relation_table.clone()));
        }

        for reserved in ["id", "created_at"] {
            if self.join_parent_column.eq_ignore_ascii_case(reserved)
                || self.join_child_column.eq_ignore_ascii_case(reserved)
            {
                return Err(LayoutError::DuplicateColumn(reserved.to_string()));
            }
        }
        if self.join_parent_column.eq_ignore_ascii_case(&self.join_child_column) {
            return Err(LayoutError::DuplicateColumn(self.join_parent_column.clone()));
        }

        Ok(())
    }
}

#[must_use]
pub fn is_valid_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    value.len() <= MAX_IDENTIFIER_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::{BTreeMap, BTreeSet};
    use std::rc::Rc;

    use proptest::prelude::*;

    use super::*;

    #[derive(Default)]
    struct FakeState {
        parents: Vec<ParentWithChildren>,
        rows: Vec<JoinRecord>,
        fail_fetch: bool,
        fail_insert_at: Option<usize>,
        fail_release: bool,
        inserts_attempted: usize,
        released: bool,
    }

    struct FakeStore {
        state: Rc<RefCell<FakeState>>,
    }

    impl FakeStore {
        fn new(parents: Vec<ParentWithChildren>) -> (Self, Rc<RefCell<FakeState>>) {
            let state = Rc::new(RefCell::new(FakeState { parents, ..FakeState::default() }));
            (Self { state: Rc::clone(&state) }, state)
        }
    }

    impl AssociationStore for FakeStore {
        fn fetch_parents_with_children(&mut self) -> Result<Vec<ParentWithChildren>, StoreError> {
            let state = self.state.borrow();
            if state.fail_fetch {
                return Err(StoreError::Connectivity("store unreachable".to_string()));
            }
            Ok(state.parents.clone())
        }

        fn insert_join(&mut self, pair: AssociationPair) -> Result<JoinRecord, StoreError> {
            let mut state = self.state.borrow_mut();
            state.inserts_attempted += 1;
            if state.fail_insert_at == Some(state.inserts_attempted) {
                return Err(StoreError::Other("disk I/O error".to_string()));
            }
            if state.rows.iter().any(|row| row.pair() == pair) {
                return Err(StoreError::ConstraintViolation(format!("duplicate pair {pair}")));
            }
            let record = JoinRecord {
                id: i64::try_from(state.rows.len()).unwrap_or(i64::MAX) + 1,
                parent_id: pair.parent_id,
                child_id: pair.child_id,
                created_at: OffsetDateTime::UNIX_EPOCH,
            };
            state.rows.push(record.clone());
            Ok(record)
        }

        fn release(self) -> Result<(), StoreError> {
            let mut state = self.state.borrow_mut();
            state.released = true;
            if state.fail_release {
                return Err(StoreError::Other("close failed".to_string()));
            }
            Ok(())
        }
    }

    fn parent(id: i64, children: &[i64]) -> ParentWithChildren {
        ParentWithChildren {
            id: ParentId(id),
            children: children.iter().copied().map(ChildId).collect(),
        }
    }

    fn pairs_of(rows: &[JoinRecord]) -> Vec<(i64, i64)> {
        rows.iter().map(|row| (row.parent_id.0, row.child_id.0)).collect()
    }

    #[test]
    fn copies_every_pair_in_fetch_order() -> Result<(), StoreError> {
        let (store, state) = FakeStore::new(vec![parent(1, &[10, 11]), parent(2, &[10])]);

        let report = run_scoped(store)?;

        assert_eq!(report.parents_scanned, 2);
        assert_eq!(report.join_records_written, 3);
        let state = state.borrow();
        assert_eq!(pairs_of(&state.rows), vec![(1, 10), (1, 11), (2, 10)]);
        assert!(state.released);
        Ok(())
    }

    #[test]
    fn parent_without_children_writes_nothing() -> Result<(), StoreError> {
        let (store, state) = FakeStore::new(vec![parent(1, &[]), parent(2, &[20])]);

        let report = run_scoped(store)?;

        assert_eq!(report.parents_without_children, 1);
        assert_eq!(report.join_records_written, 1);
        assert_eq!(pairs_of(&state.borrow().rows), vec![(2, 20)]);
        Ok(())
    }

    #[test]
    fn second_run_fails_on_duplicate_pair() -> Result<(), StoreError> {
        let (mut store, state) = FakeStore::new(vec![parent(1, &[10, 11])]);

        copy_associations(&mut store)?;
        let second = copy_associations(&mut store);

        assert!(matches!(second, Err(StoreError::ConstraintViolation(_))));
        assert_eq!(state.borrow().rows.len(), 2);
        Ok(())
    }

    #[test]
    fn fetch_failure_writes_nothing_and_releases() {
        let (store, state) = FakeStore::new(vec![parent(1, &[10])]);
        state.borrow_mut().fail_fetch = true;

        let result = run_scoped(store);

        assert!(matches!(result, Err(StoreError::Connectivity(_))));
        let state = state.borrow();
        assert!(state.rows.is_empty());
        assert_eq!(state.inserts_attempted, 0);
        assert!(state.released);
    }

    #[test]
    fn insert_failure_keeps_earlier_rows_and_releases() {
        let (store, state) = FakeStore::new(vec![parent(1, &[10, 11, 12]), parent(2, &[10])]);
        state.borrow_mut().fail_insert_at = Some(3);

        let result = run_scoped(store);

        assert_eq!(result, Err(StoreError::Other("disk I/O error".to_string())));
        let state = state.borrow();
        assert_eq!(pairs_of(&state.rows), vec![(1, 10), (1, 11)]);
        assert_eq!(state.inserts_attempted, 3);
        assert!(state.released);
    }

    #[test]
    fn copy_error_takes_precedence_over_release_error() {
        let (store, state) = FakeStore::new(vec![parent(1, &[10])]);
        {
            let mut state = state.borrow_mut();
            state.fail_fetch = true;
            state.fail_release = true;
        }

        let result = run_scoped(store);

        assert!(matches!(result, Err(StoreError::Connectivity(_))));
        assert!(state.borrow().released);
    }

    #[test]
    fn release_error_surfaces_after_successful_copy() {
        let (store, state) = FakeStore::new(vec![parent(1, &[10])]);
        state.borrow_mut().fail_release = true;

        let result = run_scoped(store);

        assert_eq!(result, Err(StoreError::Other("close failed".to_string())));
        assert_eq!(state.borrow().rows.len(), 1);
    }

    #[test]
    fn plan_preserves_parent_then_child_order() {
        let plan = plan_associations(&[parent(2, &[5, 3]), parent(1, &[]), parent(7, &[1])]);
        let flat: Vec<(i64, i64)> = plan.iter().map(|p| (p.parent_id.0, p.child_id.0)).collect();
        assert_eq!(flat, vec![(2, 5), (2, 3), (7, 1)]);
    }

    #[test]
    fn default_layout_is_valid() {
        assert_eq!(RelationLayout::default().validate(), Ok(()));
    }

    #[test]
    fn layout_rejects_unsafe_identifiers() {
        let layout =
            RelationLayout { join_table: "pc; DROP TABLE parents".to_string(), ..Default::default() };
        assert!(matches!(
            layout.validate(),
            Err(LayoutError::InvalidIdentifier { field: "join_table", .. })
        ));

        let layout = RelationLayout { child_key: "1id".to_string(), ..Default::default() };
        assert!(matches!(
            layout.validate(),
            Err(LayoutError::InvalidIdentifier { field: "child_key", .. })
        ));

        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier(&"a".repeat(MAX_IDENTIFIER_LEN + 1)));
        assert!(is_valid_identifier("_PostToTag"));
    }

    #[test]
    fn layout_rejects_colliding_names() {
        let layout =
            RelationLayout { join_table: "_ParentToChild".to_string(), ..Default::default() };
        assert_eq!(
            layout.validate(),
            Err(LayoutError::DuplicateTable("_ParentToChild".to_string()))
        );

        let layout = RelationLayout { join_child_column: "parent_id".to_string(), ..Default::default() };
        assert_eq!(layout.validate(), Err(LayoutError::DuplicateColumn("parent_id".to_string())));

        let layout = RelationLayout { join_parent_column: "id".to_string(), ..Default::default() };
        assert_eq!(layout.validate(), Err(LayoutError::DuplicateColumn("id".to_string())));
    }

    #[test]
    fn layout_yaml_fills_missing_fields_with_defaults() -> Result<(), serde_yaml::Error> {
        let layout: RelationLayout =
            serde_yaml::from_str("parent_table: Post\nchild_table: Tag\nrelation_table: _PostToTag\n")?;
        assert_eq!(layout.parent_table, "Post");
        assert_eq!(layout.relation_table, "_PostToTag");
        assert_eq!(layout.join_table, "parent_children");
        assert_eq!(layout.validate(), Ok(()));

        let unknown: Result<RelationLayout, _> = serde_yaml::from_str("join_tabel: oops\n");
        assert!(unknown.is_err());
        Ok(())
    }

    proptest! {
        #[test]
        fn property_exactly_one_join_record_per_source_pair(
            source in prop::collection::btree_map(
                0_i64..40,
                prop::collection::btree_set(0_i64..40, 0..6),
                0..12,
            )
        ) {
            let parents: Vec<ParentWithChildren> = source
                .iter()
                .map(|(id, children)| ParentWithChildren {
                    id: ParentId(*id),
                    children: children.iter().copied().map(ChildId).collect(),
                })
                .collect();
            let expected: BTreeSet<(i64, i64)> = source
                .iter()
                .flat_map(|(p, children)| children.iter().map(move |c| (*p, *c)))
                .collect();

            let (store, state) = FakeStore::new(parents);
            let report = run_scoped(store).map_err(|err| TestCaseError::fail(err.to_string()))?;

            let state = state.borrow();
            let mut seen: BTreeMap<(i64, i64), usize> = BTreeMap::new();
            for pair in pairs_of(&state.rows) {
                *seen.entry(pair).or_default() += 1;
            }
            prop_assert_eq!(report.join_records_written, expected.len());
            prop_assert!(seen.values().all(|count| *count == 1));
            prop_assert_eq!(seen.keys().copied().collect::<BTreeSet<_>>(), expected);
            prop_assert!(state.released);
        }
    }
}
