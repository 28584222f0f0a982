//! Page reconciliation
//!
//! The page set of an API key is whatever its host declared last. Every
//! InitializeHost diffs the declaration against the persisted rows:
//! matching IDs are updated in place, new IDs inserted, missing IDs deleted.

use std::collections::{HashMap, HashSet};

use crate::db::schemas::{ApiKeyDoc, Metadata, PageDoc};
use crate::protocol::PageDeclaration;
use crate::types::{PorticoError, Result};

/// Writes needed to make the persisted set equal the declared set
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PagePlan {
    pub insert: Vec<PageDoc>,
    pub update: Vec<PageDoc>,
    pub delete: Vec<String>,
}

impl PagePlan {
    pub fn is_empty(&self) -> bool {
        self.insert.is_empty() && self.update.is_empty() && self.delete.is_empty()
    }
}

/// Reject declarations with empty or repeated page IDs
pub fn validate_declarations(declared: &[PageDeclaration]) -> Result<()> {
    let mut seen = HashSet::with_capacity(declared.len());
    for page in declared {
        if page.id.trim().is_empty() {
            return Err(PorticoError::InvalidArgument("Page ID must not be empty".into()));
        }
        if !seen.insert(page.id.as_str()) {
            return Err(PorticoError::InvalidArgument(format!(
                "Page {} declared more than once",
                page.id
            )));
        }
    }
    Ok(())
}

/// Diff declared pages against the persisted rows for `api_key`.
/// Unchanged pages produce no write.
pub fn reconcile_pages(
    api_key: &ApiKeyDoc,
    declared: &[PageDeclaration],
    existing: &[PageDoc],
) -> PagePlan {
    let by_id: HashMap<&str, &PageDoc> = existing.iter().map(|p| (p.page_id.as_str(), p)).collect();
    let declared_ids: HashSet<&str> = declared.iter().map(|p| p.id.as_str()).collect();

    let mut plan = PagePlan::default();

    for page in declared {
        let wanted = PageDoc {
            _id: None,
            metadata: Metadata::default(),
            page_id: page.id.clone(),
            api_key_id: api_key.api_key_id.clone(),
            organization_id: api_key.organization_id.clone(),
            name: page.name.clone(),
            route: page.route.clone(),
            path: page.path.clone(),
        };

        match by_id.get(page.id.as_str()) {
            Some(current) if current.same_declaration(&wanted) => {}
            Some(current) => plan.update.push(PageDoc {
                _id: current._id,
                metadata: current.metadata.clone(),
                ..wanted
            }),
            None => plan.insert.push(wanted),
        }
    }

    plan.delete = existing
        .iter()
        .filter(|p| !declared_ids.contains(p.page_id.as_str()))
        .map(|p| p.page_id.clone())
        .collect();

    plan
}
