#![allow(unused_macros)]

/// Helper macro for locking items, turning a poisoned lock into [`crate::Error::LockError`]
///
/// ```rust, ignore
///  let table = lock!(self.table)?;
///  table.find(class_id);
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock.lock().map_err(|_| {
            tracing::error!("hierarchy lock poisoned");
            crate::Error::LockError
        })
    };
}

/// Helper macro for running a closure on a locked item
///
/// ```rust, ignore
///  let count = with_lock!(self.table, |table: &ClassTable| table.len())?;
/// ```
macro_rules! with_lock {
    ($lock:expr, $closure:expr) => {{
        lock!($lock).map(|guard| $closure(&*guard))
    }};
}
