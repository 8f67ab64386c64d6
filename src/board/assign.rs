//! Smart-assign policy: pick the least-loaded eligible user.

use std::collections::HashMap;

use crate::storage::UserRow;

/// Select the user with the fewest active assigned tasks.
///
/// `users` must be in stable enumeration order (first registered first);
/// ties go to the first user encountered — deterministic, never random.
/// Users absent from `active_counts` have zero active tasks.
///
/// Returns the selected user and their pre-assignment active count, or
/// `None` when no users exist.
pub fn least_loaded<'a>(
    users: &'a [UserRow],
    active_counts: &HashMap<String, i64>,
) -> Option<(&'a UserRow, i64)> {
    let mut selected: Option<(&UserRow, i64)> = None;
    for user in users {
        let count = active_counts.get(&user.id).copied().unwrap_or(0);
        match selected {
            Some((_, best)) if count >= best => {}
            _ => selected = Some((user, count)),
        }
    }
    selected
}
