//! Which statements a table's restore issues, resolved from the mode flags.
//!
//! The flags combine through a fixed lookup table instead of nested
//! conditionals, so every combination is visible (and tested) in one place.

/// The steps applied to each selected table, in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableSteps {
    /// Issue `DROP TABLE IF EXISTS` before creating the schema.
    pub drop_existing: bool,
    /// Run the table's schema definition.
    pub create_schema: bool,
    /// Replay the table's data chunks.
    pub load_data: bool,
}

const fn steps(drop_existing: bool, create_schema: bool, load_data: bool) -> TableSteps {
    TableSteps {
        drop_existing,
        create_schema,
        load_data,
    }
}

// Indexed by (schema_only << 2) | (data_only << 1) | overwrite.
const STEP_TABLE: [TableSteps; 8] = [
    steps(false, true, true),  // default
    steps(true, true, true),   // overwrite
    steps(false, false, true), // data only
    steps(true, true, true),   // data only + overwrite: a dropped table must be recreated
    steps(false, true, false), // schema only
    steps(true, true, false),  // schema only + overwrite
    steps(false, true, true),  // schema only + data only
    steps(true, true, true),   // all flags
];

impl TableSteps {
    pub fn resolve(schema_only: bool, data_only: bool, overwrite: bool) -> Self {
        let index = ((schema_only as usize) << 2) | ((data_only as usize) << 1) | overwrite as usize;
        STEP_TABLE[index]
    }

    /// Views are only recreated when schema statements run.
    pub fn restores_views(&self) -> bool {
        self.create_schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_runs_schema_then_data() {
        assert_eq!(TableSteps::resolve(false, false, false), steps(false, true, true));
    }

    #[test]
    fn test_schema_only_skips_data() {
        let s = TableSteps::resolve(true, false, false);
        assert!(s.create_schema);
        assert!(!s.load_data);
        assert!(TableSteps::resolve(true, false, true).drop_existing);
    }

    #[test]
    fn test_data_only_skips_schema() {
        let s = TableSteps::resolve(false, true, false);
        assert!(!s.create_schema);
        assert!(!s.drop_existing);
        assert!(s.load_data);
        assert!(!s.restores_views());
    }

    #[test]
    fn test_data_only_with_overwrite_recreates_schema() {
        assert_eq!(TableSteps::resolve(false, true, true), steps(true, true, true));
    }

    #[test]
    fn test_both_modes_still_create_schema() {
        let s = TableSteps::resolve(true, true, false);
        assert!(s.create_schema);
        assert!(s.load_data);
    }

    #[test]
    fn test_never_drops_without_recreating() {
        for i in 0..8 {
            let s = TableSteps::resolve(i & 4 != 0, i & 2 != 0, i & 1 != 0);
            assert!(!s.drop_existing || s.create_schema, "combination {} drops without create", i);
            assert_eq!(s.drop_existing, i & 1 != 0);
        }
    }
}
