//! Inventory: reservations against LP wallet balances, per asset.
//!
//! The book is in-memory; each swap's record mirrors the reservations it
//! holds, so the book is rebuilt from the store on startup. Balances are
//! refreshed on a cadence and on every reservation attempt; when a refresh
//! reports less than the book has reserved (an external spend), new
//! reservations are refused until the book clears.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{EngineError, EngineResult};
use crate::swap::Asset;

#[derive(Debug, Default, Clone)]
struct AssetBook {
    balance: u64,
    /// swap_id -> reserved amount.
    reserved: HashMap<String, u64>,
}

impl AssetBook {
    fn reserved_total(&self) -> u64 {
        self.reserved.values().sum()
    }
}

#[derive(Debug)]
struct Books {
    by_asset: HashMap<Asset, AssetBook>,
    last_refresh: Option<Instant>,
}

#[derive(Debug)]
pub struct Inventory {
    books: Mutex<Books>,
    refresh_every: Duration,
}

impl Inventory {
    pub fn new(refresh_every: Duration) -> Self {
        Self {
            books: Mutex::new(Books {
                by_asset: HashMap::new(),
                last_refresh: None,
            }),
            refresh_every,
        }
    }

    /// True when the balance cache is stale and the caller should fetch
    /// fresh wallet balances before the next reservation.
    pub fn needs_refresh(&self) -> bool {
        let books = self.books.lock().expect("inventory mutex poisoned");
        books
            .last_refresh
            .is_none_or(|at| at.elapsed() >= self.refresh_every)
    }

    /// Install freshly read wallet balances. A balance below the reserved
    /// total is recorded but flagged; `reserve` refuses while it lasts.
    pub fn set_balances(&self, balances: &[(Asset, u64)]) {
        let mut books = self.books.lock().expect("inventory mutex poisoned");
        for (asset, balance) in balances {
            let book = books.by_asset.entry(*asset).or_default();
            book.balance = *balance;
            let reserved = book.reserved_total();
            if *balance < reserved {
                tracing::warn!(
                    asset = ?asset,
                    balance,
                    reserved,
                    "wallet balance fell below reservations; refusing new reservations"
                );
            }
        }
        books.last_refresh = Some(Instant::now());
    }

    /// Atomically reserve `amount` of `asset` for `swap_id`. Fails when
    /// available (balance minus existing reservations) is insufficient.
    pub fn reserve(&self, asset: Asset, amount: u64, swap_id: &str) -> EngineResult<()> {
        let mut books = self.books.lock().expect("inventory mutex poisoned");
        let book = books.by_asset.entry(asset).or_default();

        let reserved = book.reserved_total();
        if book.balance < reserved {
            return Err(EngineError::StateConflict(format!(
                "inventory for {asset:?} is undercollateralized ({} < {reserved})",
                book.balance
            )));
        }
        let available = book.balance - reserved;
        if available < amount {
            return Err(EngineError::StateConflict(format!(
                "insufficient {asset:?} inventory: need {amount}, available {available}"
            )));
        }

        *book.reserved.entry(swap_id.to_string()).or_insert(0) += amount;
        Ok(())
    }

    /// Release every reservation held by `swap_id`, across assets.
    pub fn release(&self, swap_id: &str) {
        let mut books = self.books.lock().expect("inventory mutex poisoned");
        for book in books.by_asset.values_mut() {
            book.reserved.remove(swap_id);
        }
    }

    /// Rebuild the book from persisted swap records on startup.
    pub fn restore(&self, reservations: &[(String, Asset, u64)]) {
        let mut books = self.books.lock().expect("inventory mutex poisoned");
        for (swap_id, asset, amount) in reservations {
            let book = books.by_asset.entry(*asset).or_default();
            *book.reserved.entry(swap_id.clone()).or_insert(0) += amount;
        }
    }

    pub fn reserved_total(&self, asset: Asset) -> u64 {
        let books = self.books.lock().expect("inventory mutex poisoned");
        books
            .by_asset
            .get(&asset)
            .map(AssetBook::reserved_total)
            .unwrap_or(0)
    }

    pub fn available(&self, asset: Asset) -> u64 {
        let books = self.books.lock().expect("inventory mutex poisoned");
        books
            .by_asset
            .get(&asset)
            .map(|b| b.balance.saturating_sub(b.reserved_total()))
            .unwrap_or(0)
    }
}
