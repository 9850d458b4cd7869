//! History paging.
//!
//! Large histories are served page by page without loading every TxIO:
//! the SSH summary (per-height TxIO counts) is swept from the newest
//! height down, accumulating counts until the per-page target is
//! exceeded; each page records its block range and loads its ledger
//! lazily on first request.

use std::collections::BTreeMap;

use crate::error::Error;
use crate::types::dbkey::TxKey;
use crate::types::LedgerEntry;

/// One history page: a count and the block range it covers.
#[derive(Clone, Debug)]
pub struct Page {
    pub count: u32,
    pub block_start: u32,
    pub block_end: u32,
    ledgers: Option<BTreeMap<TxKey, LedgerEntry>>,
}

/// The page table of one address or wallet history. Page 0 is the most
/// recent.
#[derive(Clone, Debug, Default)]
pub struct HistoryPages {
    pages: Vec<Page>,
}

impl HistoryPages {
    /// Builds the page table from a per-height TxIO count summary.
    pub fn map_history(summary: &BTreeMap<u32, u32>, txn_per_page: u32) -> Self {
        let mut pages = Vec::new();
        let mut threshold = 0u32;
        let mut top = 0u32;

        for (&height, &count) in summary.iter().rev() {
            if threshold == 0 {
                top = height;
            }
            threshold += count;
            if threshold > txn_per_page {
                pages.push(Page {
                    count: threshold,
                    block_start: height,
                    block_end: top,
                    ledgers: None,
                });
                threshold = 0;
            }
        }

        if threshold != 0 {
            pages.push(Page {
                count: threshold,
                block_start: 0,
                block_end: top,
                ledgers: None,
            });
        }

        if pages.is_empty() {
            pages.push(Page {
                count: 0,
                block_start: 0,
                block_end: u32::MAX,
                ledgers: None,
            });
        }

        HistoryPages { pages }
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    pub fn page(&self, id: usize) -> Option<&Page> {
        self.pages.get(id)
    }

    /// The ledger map of page `id`, loading the page's block range through
    /// `loader` on first access.
    pub fn page_ledger_map(
        &mut self,
        id: usize,
        loader: impl FnOnce(u32, u32) -> Result<BTreeMap<TxKey, LedgerEntry>, Error>,
    ) -> Result<&BTreeMap<TxKey, LedgerEntry>, Error> {
        let page = self
            .pages
            .get_mut(id)
            .ok_or(crate::error::ErrorKind::UnknownId)?;
        if page.ledgers.is_none() {
            page.ledgers = Some(loader(page.block_start, page.block_end)?);
        }
        Ok(page.ledgers.as_ref().expect("just loaded"))
    }

    /// Drops every cached page ledger; the next access reloads.
    pub fn invalidate(&mut self) {
        for page in &mut self.pages {
            page.ledgers = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pages_sweep_descending_and_keep_the_residual() {
        // 3 txios at each of heights 10, 20, 30, 40 with 5 per page:
        // page 0 covers [30, 40] (6), page 1 covers [10, 20] (6).
        let summary: BTreeMap<u32, u32> = [(10, 3), (20, 3), (30, 3), (40, 3)].into();
        let pages = HistoryPages::map_history(&summary, 5);
        assert_eq!(pages.page_count(), 2);
        let first = pages.page(0).unwrap();
        assert_eq!((first.count, first.block_start, first.block_end), (6, 30, 40));
        let second = pages.page(1).unwrap();
        assert_eq!((second.count, second.block_start, second.block_end), (6, 10, 20));
    }

    #[test]
    fn residual_page_reaches_height_zero() {
        let summary: BTreeMap<u32, u32> = [(7, 2)].into();
        let pages = HistoryPages::map_history(&summary, 100);
        assert_eq!(pages.page_count(), 1);
        let only = pages.page(0).unwrap();
        assert_eq!((only.count, only.block_start, only.block_end), (2, 0, 7));
    }

    #[test]
    fn empty_history_has_one_empty_page() {
        let pages = HistoryPages::map_history(&BTreeMap::new(), 100);
        assert_eq!(pages.page_count(), 1);
        assert_eq!(pages.page(0).unwrap().count, 0);
    }

    #[test]
    fn page_ledgers_load_lazily_and_invalidate() {
        let summary: BTreeMap<u32, u32> = [(7, 2)].into();
        let mut pages = HistoryPages::map_history(&summary, 100);
        let mut loads = 0;
        for _ in 0..2 {
            pages
                .page_ledger_map(0, |_, _| {
                    loads += 1;
                    Ok(BTreeMap::new())
                })
                .unwrap();
        }
        assert_eq!(loads, 1);

        pages.invalidate();
        pages
            .page_ledger_map(0, |_, _| {
                loads += 1;
                Ok(BTreeMap::new())
            })
            .unwrap();
        assert_eq!(loads, 2);
    }
}
