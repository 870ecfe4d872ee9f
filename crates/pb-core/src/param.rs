//! Typed parameters: 2-D cell grids with coercion, clamping, and change
//! subscribers.
//!
//! Cell storage sits behind a plain mutex; reads and writes never suspend.
//! Subscribers run synchronously on the writer, over a snapshot of the
//! callback list taken before invocation, so a callback may itself write
//! other parameters (or this one) without deadlocking.

use chrono::{DateTime, Utc};
use pb_protocol::{ParamInfo, ParamType, ParamValue};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Change subscriber: `(param, row, col, new, old)`, invoked only when the
/// stored value actually changed.
pub type ChangeCallback =
    Arc<dyn Fn(&Parameter, u16, u16, &ParamValue, &ParamValue) + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ParamError {
    #[error("cell [{row},{col}] out of range for {rows}x{cols} grid")]
    CellOutOfRange { row: u16, col: u16, rows: u16, cols: u16 },
    #[error("cannot coerce '{value}' to {target}")]
    Coerce { value: String, target: ParamType },
}

struct Cells {
    values: Vec<ParamValue>,
    last_updated: Option<DateTime<Utc>>,
}

/// One typed parameter: metadata plus a `rows x cols` grid of cells.
///
/// Every cell is defined from construction on (initialized to the default
/// value); writes are coerced to the declared type and, for numerics,
/// clamped to `[min, max]`.
pub struct Parameter {
    name: String,
    param_id: u32,
    param_type: ParamType,
    rows: u16,
    cols: u16,
    read_only: bool,
    /// `Some` for int/float parameters only.
    bounds: Option<(f64, f64)>,
    cells: Mutex<Cells>,
    subscribers: RwLock<Vec<ChangeCallback>>,
}

impl Parameter {
    fn new(
        name: &str,
        param_id: u32,
        param_type: ParamType,
        rows: u16,
        cols: u16,
        bounds: Option<(f64, f64)>,
        default: ParamValue,
        read_only: bool,
    ) -> Self {
        assert!(rows >= 1 && cols >= 1, "parameter grid must be at least 1x1");
        let cell_count = usize::from(rows) * usize::from(cols);
        Self {
            name: name.to_owned(),
            param_id,
            param_type,
            rows,
            cols,
            read_only,
            bounds,
            cells: Mutex::new(Cells {
                values: vec![default; cell_count],
                last_updated: None,
            }),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    pub fn new_int(
        name: &str,
        param_id: u32,
        rows: u16,
        cols: u16,
        min: i64,
        max: i64,
        default: i64,
        read_only: bool,
    ) -> Self {
        Self::new(
            name,
            param_id,
            ParamType::Int,
            rows,
            cols,
            Some((min as f64, max as f64)),
            ParamValue::Int(default.clamp(min, max)),
            read_only,
        )
    }

    pub fn new_float(
        name: &str,
        param_id: u32,
        rows: u16,
        cols: u16,
        min: f64,
        max: f64,
        default: f64,
        read_only: bool,
    ) -> Self {
        Self::new(
            name,
            param_id,
            ParamType::Float,
            rows,
            cols,
            Some((min, max)),
            ParamValue::Float(default.clamp(min, max)),
            read_only,
        )
    }

    pub fn new_bool(
        name: &str,
        param_id: u32,
        rows: u16,
        cols: u16,
        default: bool,
        read_only: bool,
    ) -> Self {
        Self::new(
            name,
            param_id,
            ParamType::Bool,
            rows,
            cols,
            None,
            ParamValue::Bool(default),
            read_only,
        )
    }

    pub fn new_str(
        name: &str,
        param_id: u32,
        rows: u16,
        cols: u16,
        default: &str,
        read_only: bool,
    ) -> Self {
        Self::new(
            name,
            param_id,
            ParamType::Str,
            rows,
            cols,
            None,
            ParamValue::Str(default.to_owned()),
            read_only,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn param_id(&self) -> u32 {
        self.param_id
    }

    pub fn param_type(&self) -> ParamType {
        self.param_type
    }

    pub fn rows(&self) -> u16 {
        self.rows
    }

    pub fn cols(&self) -> u16 {
        self.cols
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.lock_cells().last_updated
    }

    /// Register a change subscriber.  Subscribers fire in registration
    /// order.
    pub fn subscribe(&self, callback: ChangeCallback) {
        self.subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(callback);
    }

    /// Read one cell.
    pub fn get(&self, row: u16, col: u16) -> Result<ParamValue, ParamError> {
        let idx = self.cell_index(row, col)?;
        Ok(self.lock_cells().values[idx].clone())
    }

    /// Write one cell: coerce, clamp, store, and (when `notify` is set and
    /// the stored value changed) invoke subscribers.
    ///
    /// Returns the value actually stored.  `read_only` is not enforced
    /// here; it is a protocol-layer gate so state owners can update their
    /// own read-only cells.
    pub fn set(
        &self,
        row: u16,
        col: u16,
        value: ParamValue,
        notify: bool,
    ) -> Result<ParamValue, ParamError> {
        let idx = self.cell_index(row, col)?;
        let coerced = self.coerce(value)?;

        let (old, changed) = {
            let mut cells = self.lock_cells();
            let old = std::mem::replace(&mut cells.values[idx], coerced.clone());
            cells.last_updated = Some(Utc::now());
            let changed = old != coerced;
            (old, changed)
        };

        if notify && changed {
            // Snapshot so a subscriber may register further subscribers or
            // write parameters without holding any lock here.
            let snapshot: Vec<ChangeCallback> = self
                .subscribers
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            for callback in snapshot {
                callback(self, row, col, &coerced, &old);
            }
        }

        Ok(coerced)
    }

    /// Metadata blob for the wire.
    pub fn describe(&self) -> ParamInfo {
        let (min, max) = match (self.param_type, self.bounds) {
            (ParamType::Int, Some((min, max))) => (
                Some(ParamValue::Int(min as i64)),
                Some(ParamValue::Int(max as i64)),
            ),
            (ParamType::Float, Some((min, max))) => (
                Some(ParamValue::Float(min)),
                Some(ParamValue::Float(max)),
            ),
            _ => (None, None),
        };
        ParamInfo {
            name: self.name.clone(),
            param_id: self.param_id,
            param_type: Some(self.param_type),
            rows: self.rows,
            cols: self.cols,
            read_only: self.read_only,
            min,
            max,
        }
    }

    // -- internal --

    fn lock_cells(&self) -> std::sync::MutexGuard<'_, Cells> {
        self.cells.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cell_index(&self, row: u16, col: u16) -> Result<usize, ParamError> {
        if row >= self.rows || col >= self.cols {
            return Err(ParamError::CellOutOfRange {
                row,
                col,
                rows: self.rows,
                cols: self.cols,
            });
        }
        Ok(usize::from(row) * usize::from(self.cols) + usize::from(col))
    }

    fn coerce(&self, value: ParamValue) -> Result<ParamValue, ParamError> {
        match self.param_type {
            ParamType::Int => {
                let n = match &value {
                    ParamValue::Int(i) => *i,
                    ParamValue::Float(f) => *f as i64,
                    ParamValue::Bool(b) => i64::from(*b),
                    ParamValue::Str(s) => {
                        s.trim().parse::<i64>().map_err(|_| ParamError::Coerce {
                            value: s.clone(),
                            target: ParamType::Int,
                        })?
                    }
                };
                let (min, max) = self.bounds.unwrap_or((f64::MIN, f64::MAX));
                Ok(ParamValue::Int(n.clamp(min as i64, max as i64)))
            }
            ParamType::Float => {
                let f = match &value {
                    ParamValue::Int(i) => *i as f64,
                    ParamValue::Float(f) => *f,
                    ParamValue::Bool(b) => f64::from(u8::from(*b)),
                    ParamValue::Str(s) => {
                        s.trim().parse::<f64>().map_err(|_| ParamError::Coerce {
                            value: s.clone(),
                            target: ParamType::Float,
                        })?
                    }
                };
                let (min, max) = self.bounds.unwrap_or((f64::MIN, f64::MAX));
                Ok(ParamValue::Float(f.clamp(min, max)))
            }
            ParamType::Bool => {
                let b = match &value {
                    ParamValue::Bool(b) => *b,
                    ParamValue::Int(i) => *i != 0,
                    ParamValue::Float(f) => *f != 0.0,
                    ParamValue::Str(s) => {
                        matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes")
                    }
                };
                Ok(ParamValue::Bool(b))
            }
            ParamType::Str => Ok(ParamValue::Str(value.to_string())),
        }
    }
}

impl std::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parameter")
            .field("name", &self.name)
            .field("param_id", &self.param_id)
            .field("type", &self.param_type)
            .field("rows", &self.rows)
            .field("cols", &self.cols)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn every_cell_is_initialized_to_default() {
        let p = Parameter::new_int("grid", 1, 3, 4, 0, 100, 7, false);
        for row in 0..3 {
            for col in 0..4 {
                assert_eq!(p.get(row, col).unwrap(), ParamValue::Int(7));
            }
        }
        assert!(p.get(3, 0).is_err());
        assert!(p.get(0, 4).is_err());
    }

    #[test]
    fn int_set_clamps_to_declared_range() {
        let p = Parameter::new_int("level", 1, 1, 1, 0, 100, 0, false);
        let stored = p.set(0, 0, ParamValue::Int(150), true).unwrap();
        assert_eq!(stored, ParamValue::Int(100));
        let stored = p.set(0, 0, ParamValue::Int(-5), true).unwrap();
        assert_eq!(stored, ParamValue::Int(0));
    }

    #[test]
    fn int_coerces_from_float_bool_and_string() {
        let p = Parameter::new_int("n", 1, 1, 1, -10, 10, 0, false);
        assert_eq!(p.set(0, 0, ParamValue::Float(3.9), false).unwrap(), ParamValue::Int(3));
        assert_eq!(p.set(0, 0, ParamValue::Bool(true), false).unwrap(), ParamValue::Int(1));
        assert_eq!(
            p.set(0, 0, ParamValue::Str("8".to_owned()), false).unwrap(),
            ParamValue::Int(8)
        );
        assert!(p.set(0, 0, ParamValue::Str("eight".to_owned()), false).is_err());
    }

    #[test]
    fn bool_coerces_from_common_truthy_spellings() {
        let p = Parameter::new_bool("flag", 1, 1, 1, false, false);
        for truthy in ["true", "1", "yes", "TRUE", "Yes"] {
            p.set(0, 0, ParamValue::Bool(false), false).unwrap();
            let stored = p.set(0, 0, ParamValue::Str(truthy.to_owned()), false).unwrap();
            assert_eq!(stored, ParamValue::Bool(true), "spelling {truthy:?}");
        }
        assert_eq!(
            p.set(0, 0, ParamValue::Str("false".to_owned()), false).unwrap(),
            ParamValue::Bool(false)
        );
        assert_eq!(p.set(0, 0, ParamValue::Int(0), false).unwrap(), ParamValue::Bool(false));
        assert_eq!(p.set(0, 0, ParamValue::Int(2), false).unwrap(), ParamValue::Bool(true));
    }

    #[test]
    fn string_coerces_via_display() {
        let p = Parameter::new_str("label", 1, 1, 1, "", false);
        assert_eq!(
            p.set(0, 0, ParamValue::Int(42), false).unwrap(),
            ParamValue::Str("42".to_owned())
        );
        assert_eq!(
            p.set(0, 0, ParamValue::Bool(true), false).unwrap(),
            ParamValue::Str("true".to_owned())
        );
    }

    #[test]
    fn unchanged_set_fires_no_subscribers() {
        let p = Arc::new(Parameter::new_int("level", 1, 1, 1, 0, 100, 0, false));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        p.subscribe(Arc::new(move |_, _, _, _, _| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));

        p.set(0, 0, ParamValue::Int(5), true).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Same value again: no notification.
        p.set(0, 0, ParamValue::Int(5), true).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Clamped duplicate: 150 clamps to 100, then 100 again is a no-op.
        p.set(0, 0, ParamValue::Int(150), true).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        p.set(0, 0, ParamValue::Int(100), true).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn subscribers_fire_in_registration_order_with_old_and_new() {
        let p = Arc::new(Parameter::new_int("level", 1, 1, 1, 0, 100, 10, false));
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let order = order.clone();
            p.subscribe(Arc::new(move |_, row, col, new, old| {
                order
                    .lock()
                    .unwrap()
                    .push((tag, row, col, new.clone(), old.clone()));
            }));
        }

        p.set(0, 0, ParamValue::Int(20), true).unwrap();
        let seen = order.lock().unwrap();
        assert_eq!(
            *seen,
            vec![
                ("first", 0, 0, ParamValue::Int(20), ParamValue::Int(10)),
                ("second", 0, 0, ParamValue::Int(20), ParamValue::Int(10)),
            ]
        );
    }

    #[test]
    fn subscriber_may_reenter_and_write_the_same_parameter() {
        // Models the trigger-reset pattern: the callback writes the cell
        // back with notify=false.
        let p = Arc::new(Parameter::new_int("trigger", 1, 1, 1, -1, 99, -1, false));
        let p2 = p.clone();
        p.subscribe(Arc::new(move |_, _, _, new, _| {
            if *new != ParamValue::Int(-1) {
                p2.set(0, 0, ParamValue::Int(-1), false).unwrap();
            }
        }));

        p.set(0, 0, ParamValue::Int(5), true).unwrap();
        assert_eq!(p.get(0, 0).unwrap(), ParamValue::Int(-1));
    }

    #[test]
    fn notify_false_suppresses_subscribers_but_stores() {
        let p = Arc::new(Parameter::new_str("cell", 1, 1, 1, "", false));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        p.subscribe(Arc::new(move |_, _, _, _, _| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));

        p.set(0, 0, ParamValue::Str("payload".to_owned()), false).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(p.get(0, 0).unwrap(), ParamValue::Str("payload".to_owned()));
    }

    #[test]
    fn describe_carries_bounds_only_for_numerics() {
        let int = Parameter::new_int("i", 1, 1, 1, 0, 100, 0, false);
        let info = int.describe();
        assert_eq!(info.min, Some(ParamValue::Int(0)));
        assert_eq!(info.max, Some(ParamValue::Int(100)));

        let text = Parameter::new_str("s", 2, 1, 1, "", true);
        let info = text.describe();
        assert_eq!(info.min, None);
        assert_eq!(info.max, None);
        assert!(info.read_only);
    }

    #[test]
    fn last_updated_is_stamped_on_write() {
        let p = Parameter::new_int("n", 1, 1, 1, 0, 10, 0, false);
        assert!(p.last_updated().is_none());
        p.set(0, 0, ParamValue::Int(1), false).unwrap();
        assert!(p.last_updated().is_some());
    }
}
