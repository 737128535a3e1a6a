//! Path labeling: annotate every node with its JSON path.
//!
//! The root is labeled `""`; a named sub-composition field extends its
//! parent's path with `.field` and a components element with `[index]`.
//! Labels are diagnostics carried into the flattened program (and surfaced
//! by the conductor's step traces), never identity: two structurally equal
//! trees label identically, and relabeling is idempotent.

use crate::ast::Composition;

/// Label a composition tree, overwriting any existing paths.
#[must_use]
pub fn label(composition: Composition) -> Composition {
    label_with(composition, String::new())
}

fn label_with(composition: Composition, path: String) -> Composition {
    let mut composition = composition.map_children(|child, field| {
        let mut child_path = path.clone();
        child_path.push_str(&field.segment());
        label_with(child, child_path)
    });
    composition.path = Some(path);
    composition
}
