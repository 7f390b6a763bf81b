//! Accounting core for a collateralized-debt-position lending ledger.
//!
//! Borrowers lock collateral and mint debt against it; positions sharing an
//! interest rate are accounted for in aggregate as a "bucket". The engine
//! guarantees:
//! 1. Debt conservation: total system debt equals the sum of every
//!    position's effective debt plus uncollected fee income, to within
//!    share-rounding dust, at every settled checkpoint.
//! 2. O(1) operations: interest accrual, liquidation socialization, and
//!    redemption effects reach positions lazily through per-share
//!    accumulators; no operation ever iterates the position set.
//! 3. Copy-then-commit: every public operation computes on value copies and
//!    writes back only after all validation passes. A failed operation
//!    leaves the ledger untouched.
//! 4. Flash mint/borrow atomicity: operation-class locks guard the callback
//!    window; an unrepaid flash operation unwinds completely.
//!
//! External collaborators (debt token, position ownership registry, price
//! oracle, flash callback) are consumed through traits; in-memory reference
//! implementations live at the bottom of the capability section and back the
//! test suites.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

// MAX_BUCKETS is feature-configured, not target-configured, so every build
// of a given feature set agrees on index geometry.
#[cfg(kani)]
pub const MAX_BUCKETS: usize = 64; // Single bitmap word for fast formal verification

#[cfg(all(feature = "test", not(kani)))]
pub const MAX_BUCKETS: usize = 4096; // Small for tests

#[cfg(all(not(kani), not(feature = "test")))]
pub const MAX_BUCKETS: usize = 65536; // Production

// Derived constants
pub const BITMAP_WORDS: usize = (MAX_BUCKETS + 63) / 64;

/// Seconds per compounding year (365 days).
pub const YEAR_SECONDS: u64 = 365 * 86400;

/// Sentinel delta meaning "withdraw everything" / "repay everything".
pub const CLOSE_DELTA: i128 = i128::MIN;

/// Permission bits checked against the position-ownership registry.
pub const PERM_BORROW: u8 = 1 << 0;
pub const PERM_REPAY: u8 = 1 << 1;
pub const PERM_DEPOSIT: u8 = 1 << 2;
pub const PERM_WITHDRAW: u8 = 1 << 3;
pub const PERM_ADJUST_RATE: u8 = 1 << 4;

// ============================================================================
// Fixed-Point Math (see src/wad.rs)
// ============================================================================
pub mod wad;
pub use wad::{mul_div, wad_div, wad_exp, wad_ln, wad_mul, Rounding, WAD};

// ============================================================================
// Errors
// ============================================================================

/// Failures reported by the external debt-token ledger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("insufficient allowance")]
    InsufficientAllowance,
}

/// Every failure a ledger operation can surface. Variants carry the values
/// needed to reconstruct the failing check.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("amount must be non-zero")]
    ZeroAmount,
    #[error("collateral payment {paid} does not match expected {expected}")]
    MismatchedCollateralPayment { expected: u128, paid: u128 },
    #[error("interest rate {rate} outside [{min}, {max}]")]
    RateOutOfBounds { rate: u128, min: u128, max: u128 },
    #[error("interest rate {rate} not a multiple of increment {increment}")]
    RateNotAligned { rate: u128, increment: u128 },
    #[error("debt {debt} below minimum {min}")]
    BelowMinimumDebt { debt: u128, min: u128 },
    #[error("collateral {collateral} below minimum {min}")]
    BelowMinimumCollateral { collateral: u128, min: u128 },
    #[error("unknown position {position_id}")]
    UnknownPosition { position_id: u64 },
    #[error("invalid parameters: {0}")]
    InvalidParams(&'static str),
    #[error("arithmetic overflow")]
    Overflow,
    #[error("caller lacks permissions {required:#04x} on position {position_id}")]
    NotAuthorized { position_id: u64, required: u8 },
    #[error("position collateral ratio {cratio} below required {required}")]
    PositionUndercollateralized { cratio: u128, required: u128 },
    #[error("system collateral ratio {cratio} below required {required}")]
    SystemUndercollateralized { cratio: u128, required: u128 },
    #[error("collateral price is missing or stale")]
    InvalidCollateralPrice,
    #[error("flash mint in progress")]
    FlashMintInProgress,
    #[error("flash borrow in progress")]
    FlashBorrowInProgress,
    #[error("flash borrow not repaid: {outstanding} outstanding")]
    FlashBorrowNotRepaid { outstanding: u128 },
    #[error("no flash borrow outstanding")]
    NoFlashBorrowOutstanding,
    #[error("flash callback rejected the operation")]
    OperationFailed,
    #[error("collateral ratio {cratio} above liquidation threshold {threshold}")]
    NotEligibleForLiquidation { cratio: u128, threshold: u128 },
    #[error("collateral ratio {cratio} above full-liquidation threshold {threshold}")]
    NotEligibleForFullLiquidation { cratio: u128, threshold: u128 },
    #[error("insufficient collateral")]
    InsufficientCollateral,
    #[error("collateral out {actual} below caller minimum {min}")]
    MinAmountOutNotMet { actual: u128, min: u128 },
    #[error("token ledger: {0}")]
    Token(#[from] TokenError),
}

pub type Result<T> = core::result::Result<T, LedgerError>;

// ============================================================================
// External Capabilities
// ============================================================================

/// Opaque actor identity used by the external ledgers (owners, callers,
/// recipients). The engine never inspects it.
pub type ActorId = [u8; 32];

/// Signed approval forwarded to the debt-token ledger before a repayment is
/// pulled, so callers can approve and act in one call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Permit {
    pub owner: ActorId,
    pub amount: u128,
}

/// Which asset a flash callback received.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlashAsset {
    DebtToken,
    Collateral,
}

/// Fungible debt-token ledger. `burn` and `transfer` spend the allowance the
/// `from` actor granted to the ledger actor (except when `from` is the
/// ledger itself).
pub trait DebtToken {
    fn mint(&mut self, to: ActorId, amount: u128) -> core::result::Result<(), TokenError>;
    fn burn(&mut self, from: ActorId, amount: u128) -> core::result::Result<(), TokenError>;
    fn transfer(
        &mut self,
        from: ActorId,
        to: ActorId,
        amount: u128,
    ) -> core::result::Result<(), TokenError>;
    fn approve(&mut self, owner: ActorId, spender: ActorId, amount: u128);
    fn allowance(&self, owner: ActorId, spender: ActorId) -> u128;
}

/// Transferable position-ownership registry. `authorized` answers whether
/// `caller` holds every permission bit in `permissions` for the position.
pub trait PositionRegistry {
    fn mint(&mut self, owner: ActorId) -> u64;
    fn authorized(&self, position_id: u64, caller: ActorId, permissions: u8) -> bool;
}

/// Collateral price feed. Returns (WAD-scaled price, is_stale).
pub trait PriceOracle {
    fn latest_price(&self) -> (u128, bool);
}

/// Flash-operation callback. Receives the engine back by `&mut`, which is
/// what lets a callback legitimately re-enter permitted operations (and lets
/// the tests probe the lock discipline without a host).
pub trait FlashLoanReceiver<T, R, O> {
    fn execute_operation(
        &mut self,
        ledger: &mut LedgerEngine<T, R, O>,
        asset: FlashAsset,
        amount: u128,
        fee: u128,
        initiator: ActorId,
        data: &[u8],
    ) -> bool;
}

/// Reference debt-token ledger: plain balance/allowance maps.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InMemoryToken {
    /// Actor whose burns/transfers bypass the allowance check (the ledger).
    pub ledger: ActorId,
    pub balances: BTreeMap<ActorId, u128>,
    pub allowances: BTreeMap<(ActorId, ActorId), u128>,
    pub total_supply: u128,
}

impl InMemoryToken {
    pub fn new(ledger: ActorId) -> Self {
        Self {
            ledger,
            ..Self::default()
        }
    }

    pub fn balance_of(&self, actor: ActorId) -> u128 {
        self.balances.get(&actor).copied().unwrap_or(0)
    }

    fn spend_allowance(
        &mut self,
        from: ActorId,
        amount: u128,
    ) -> core::result::Result<(), TokenError> {
        if from == self.ledger {
            return Ok(());
        }
        let key = (from, self.ledger);
        let granted = self.allowances.get(&key).copied().unwrap_or(0);
        if granted < amount {
            return Err(TokenError::InsufficientAllowance);
        }
        self.allowances.insert(key, granted - amount);
        Ok(())
    }

    fn debit(&mut self, from: ActorId, amount: u128) -> core::result::Result<(), TokenError> {
        let bal = self.balance_of(from);
        if bal < amount {
            return Err(TokenError::InsufficientBalance);
        }
        self.balances.insert(from, bal - amount);
        Ok(())
    }

    fn credit(&mut self, to: ActorId, amount: u128) {
        let bal = self.balance_of(to);
        self.balances.insert(to, bal.saturating_add(amount));
    }
}

impl DebtToken for InMemoryToken {
    fn mint(&mut self, to: ActorId, amount: u128) -> core::result::Result<(), TokenError> {
        self.credit(to, amount);
        self.total_supply = self.total_supply.saturating_add(amount);
        Ok(())
    }

    fn burn(&mut self, from: ActorId, amount: u128) -> core::result::Result<(), TokenError> {
        self.spend_allowance(from, amount)?;
        self.debit(from, amount)?;
        self.total_supply = self.total_supply.saturating_sub(amount);
        Ok(())
    }

    fn transfer(
        &mut self,
        from: ActorId,
        to: ActorId,
        amount: u128,
    ) -> core::result::Result<(), TokenError> {
        self.spend_allowance(from, amount)?;
        self.debit(from, amount)?;
        self.credit(to, amount);
        Ok(())
    }

    fn approve(&mut self, owner: ActorId, spender: ActorId, amount: u128) {
        self.allowances.insert((owner, spender), amount);
    }

    fn allowance(&self, owner: ActorId, spender: ActorId) -> u128 {
        self.allowances.get(&(owner, spender)).copied().unwrap_or(0)
    }
}

/// Reference ownership registry: sequential ids starting at 1, owner holds
/// every permission bit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SequentialRegistry {
    pub next_id: u64,
    pub owners: BTreeMap<u64, ActorId>,
}

impl Default for SequentialRegistry {
    fn default() -> Self {
        Self {
            next_id: 1,
            owners: BTreeMap::new(),
        }
    }
}

impl SequentialRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PositionRegistry for SequentialRegistry {
    fn mint(&mut self, owner: ActorId) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.owners.insert(id, owner);
        id
    }

    fn authorized(&self, position_id: u64, caller: ActorId, _permissions: u8) -> bool {
        self.owners.get(&position_id) == Some(&caller)
    }
}

/// Reference oracle: fixed price and staleness flag, poked directly by tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedOracle {
    pub price: u128,
    pub stale: bool,
}

impl FixedOracle {
    pub fn new(price: u128, stale: bool) -> Self {
        Self { price, stale }
    }
}

impl PriceOracle for FixedOracle {
    fn latest_price(&self) -> (u128, bool) {
        (self.price, self.stale)
    }
}

/// Callback that accepts the funds and does nothing. A flash mint against it
/// fails at repayment (no approval), which makes it useful for exercising
/// the unwind paths.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NoOpReceiver;

impl<T, R, O> FlashLoanReceiver<T, R, O> for NoOpReceiver {
    fn execute_operation(
        &mut self,
        _ledger: &mut LedgerEngine<T, R, O>,
        _asset: FlashAsset,
        _amount: u128,
        _fee: u128,
        _initiator: ActorId,
        _data: &[u8],
    ) -> bool {
        true
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Ledger parameters, fixed at construction.
///
/// Ratios and percentages are WAD-scaled. The three collateralization
/// thresholds satisfy `WAD < full_liquidation_ratio <= liquidation_ratio <=
/// issuance_ratio`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LedgerParams {
    /// Actor identity of the ledger itself (allowance spender).
    pub ledger_actor: ActorId,
    /// Receives realized fees, liquidation penalty remainders, flash fees.
    pub fee_recipient: ActorId,
    pub min_collateral: u128,
    pub min_debt: u128,
    /// Annual interest rate bounds and step, WAD-scaled.
    pub min_rate: u128,
    pub max_rate: u128,
    pub rate_increment: u128,
    /// Minimum collateral ratio to issue or keep new debt.
    pub issuance_ratio: u128,
    /// At or below this ratio a position is partially liquidatable.
    pub liquidation_ratio: u128,
    /// At or below this (lower) ratio a position is fully liquidatable.
    pub full_liquidation_ratio: u128,
    /// Partial liquidation penalty as a fraction of the corrected amount.
    pub liquidation_penalty_pct: u128,
    /// Fraction of the penalty collateral paid to the liquidator.
    pub liquidation_reward_pct: u128,
    /// Cap on the liquidator reward, in value units.
    pub max_liquidation_reward: u128,
    /// Fixed debt-token reward minted to a full liquidator.
    pub full_liquidation_reward: u128,
    /// Redemption fee floor (f_min).
    pub redemption_base_fee: u128,
    /// Redemption fee scalar (K).
    pub redemption_fee_scalar: u128,
    /// Redemption buffer decay period, seconds.
    pub redemption_decay_period: u64,
    /// Fee percentage cap routed to the treasury; the rest of the fee stays
    /// with the redeemed bucket's members.
    pub redemption_treasury_threshold: u128,
    /// Fee folded into every new debt issuance.
    pub opening_fee_pct: u128,
    pub flash_mint_fee_pct: u128,
    pub flash_borrow_fee_pct: u128,
}

impl LedgerParams {
    /// Number of rate steps covered by [min_rate, max_rate].
    pub fn bucket_count(&self) -> u128 {
        if self.rate_increment == 0 {
            return 0;
        }
        (self.max_rate - self.min_rate) / self.rate_increment + 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate_increment == 0 {
            return Err(LedgerError::InvalidParams("rate increment must be non-zero"));
        }
        if self.min_rate > self.max_rate {
            return Err(LedgerError::InvalidParams("min rate above max rate"));
        }
        if (self.max_rate - self.min_rate) % self.rate_increment != 0 {
            return Err(LedgerError::InvalidParams("rate span not aligned to increment"));
        }
        if self.bucket_count() > MAX_BUCKETS as u128 {
            return Err(LedgerError::InvalidParams("rate span exceeds bucket capacity"));
        }
        if self.issuance_ratio <= WAD {
            return Err(LedgerError::InvalidParams("issuance ratio must exceed 1"));
        }
        if self.liquidation_ratio > self.issuance_ratio {
            return Err(LedgerError::InvalidParams("liquidation ratio above issuance ratio"));
        }
        if self.full_liquidation_ratio > self.liquidation_ratio {
            return Err(LedgerError::InvalidParams(
                "full-liquidation ratio above liquidation ratio",
            ));
        }
        if self.full_liquidation_ratio <= WAD {
            return Err(LedgerError::InvalidParams("full-liquidation ratio must exceed 1"));
        }
        if self.liquidation_penalty_pct >= WAD {
            return Err(LedgerError::InvalidParams("liquidation penalty must be below 100%"));
        }
        if self.liquidation_reward_pct > WAD {
            return Err(LedgerError::InvalidParams("liquidation reward above 100%"));
        }
        if self.redemption_base_fee > WAD {
            return Err(LedgerError::InvalidParams("redemption base fee above 100%"));
        }
        if self.redemption_treasury_threshold > WAD {
            return Err(LedgerError::InvalidParams("treasury threshold above 100%"));
        }
        if self.redemption_decay_period == 0 {
            return Err(LedgerError::InvalidParams("decay period must be non-zero"));
        }
        if self.opening_fee_pct >= WAD {
            return Err(LedgerError::InvalidParams("opening fee must be below 100%"));
        }
        if self.flash_mint_fee_pct >= WAD || self.flash_borrow_fee_pct >= WAD {
            return Err(LedgerError::InvalidParams("flash fee must be below 100%"));
        }
        Ok(())
    }
}

// ============================================================================
// Core Data Structures
// ============================================================================

/// System-wide vault. Bucket debts are claims (shares) on `total_debt -
/// pending_fees`; a bucket's debt is never stored, always derived.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GlobalLedger {
    /// All debt the system tracks, including uncollected fee income.
    pub total_debt: u128,
    /// Shares outstanding against `total_debt - pending_fees`.
    pub total_debt_shares: u128,
    /// Fee income realized but not yet collected. Always <= total_debt.
    pub pending_fees: u128,
    /// Full-liquidation socialization accumulators, per global share, WAD.
    pub acc_liquidated_collateral_per_share: u128,
    pub acc_liquidated_debt_per_share: u128,
    /// Socialized debt not yet pulled into any bucket.
    pub unrealized_liquidated_debt: u128,
}

impl GlobalLedger {
    /// Vault assets backing bucket shares.
    pub fn allocated_debt(&self) -> u128 {
        self.total_debt.saturating_sub(self.pending_fees)
    }
}

/// Per-(rate, epoch) aggregate. Keyed externally by (rate step, epoch); the
/// record itself holds only balances and accumulators.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BucketLedger {
    /// Shares positions hold against this bucket's derived debt.
    pub total_debt_shares: u128,
    /// This bucket's claim on the global vault.
    pub global_debt_shares: u128,
    /// Collateral owned by this bucket's members.
    pub collateral: u128,
    /// Member-facing accumulators, per bucket share, WAD.
    pub acc_liquidated_collateral_per_share: u128,
    pub acc_redeemed_collateral_per_share: u128,
    pub acc_interest_per_share: u128,
    /// Global accumulator snapshots from the last settlement.
    pub last_seen_global_liq_collateral: u128,
    pub last_seen_global_liq_debt: u128,
    pub last_update_time: u64,
}

impl BucketLedger {
    /// A fresh bucket snapshots the global accumulators at creation so it
    /// never pulls socialization that predates it.
    pub fn new(global: &GlobalLedger, now: u64) -> Self {
        Self {
            last_seen_global_liq_collateral: global.acc_liquidated_collateral_per_share,
            last_seen_global_liq_debt: global.acc_liquidated_debt_per_share,
            last_update_time: now,
            ..Self::default()
        }
    }
}

/// A single debt position. Debt is `debt_shares` against the position's
/// bucket; collateral is absolute, adjusted lazily from bucket accumulators.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Position {
    pub collateral: u128,
    pub debt_shares: u128,
    /// Annual rate, WAD. Identifies the bucket together with `bucket_epoch`.
    pub interest_rate: u128,
    pub bucket_epoch: u64,
    /// Bucket accumulator snapshots from the last settlement.
    pub last_seen_bucket_liq_collateral: u128,
    pub last_seen_bucket_redeemed_collateral: u128,
    /// Opening-fee amortization mark: the outstanding fee is
    /// `(target_acc_interest - bucket.acc_interest_per_share)+ * shares`.
    pub target_acc_interest: u128,
}

impl Position {
    /// A new membership snapshots the bucket's accumulators at join time so
    /// epoch-crossing and pre-join history never reach it.
    pub fn new(interest_rate: u128, bucket_epoch: u64, bucket: &BucketLedger) -> Self {
        Self {
            interest_rate,
            bucket_epoch,
            last_seen_bucket_liq_collateral: bucket.acc_liquidated_collateral_per_share,
            last_seen_bucket_redeemed_collateral: bucket.acc_redeemed_collateral_per_share,
            target_acc_interest: bucket.acc_interest_per_share,
            ..Self::default()
        }
    }
}

// ============================================================================
// Views & Outcomes
// ============================================================================

/// Settled snapshot of one position.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PositionState {
    pub position_id: u64,
    pub collateral: u128,
    /// Share-derived debt net of the unamortized opening fee.
    pub debt: u128,
    /// Unamortized opening fee still owed.
    pub outstanding_fee: u128,
    /// debt + outstanding_fee; what caps repayment and drives risk checks.
    pub effective_debt: u128,
    pub interest_rate: u128,
    pub bucket_epoch: u64,
    pub debt_shares: u128,
}

/// Settled snapshot of one bucket (current epoch at the given rate).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketState {
    pub interest_rate: u128,
    pub epoch: u64,
    pub debt: u128,
    pub collateral: u128,
    pub total_debt_shares: u128,
    pub global_debt_shares: u128,
    pub acc_interest_per_share: u128,
    pub acc_liquidated_collateral_per_share: u128,
    pub acc_redeemed_collateral_per_share: u128,
    pub last_update_time: u64,
}

/// Snapshot of the global vault and engine flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GlobalState {
    pub total_debt: u128,
    pub total_debt_shares: u128,
    pub pending_fees: u128,
    pub unrealized_liquidated_debt: u128,
    pub acc_liquidated_collateral_per_share: u128,
    pub acc_liquidated_debt_per_share: u128,
    pub total_collateral: u128,
    pub redemption_buffer: u128,
    pub last_redemption_time: u64,
    pub flash_mint_active: bool,
    pub flash_borrow_outstanding: u128,
    pub now: u64,
}

/// What a position modification actually did, after sentinel resolution and
/// capping. Deltas are token flows: positive debt delta is tokens minted to
/// the caller, negative is tokens burned from the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModifyOutcome {
    pub position_id: u64,
    pub actual_collateral_delta: i128,
    pub actual_debt_delta: i128,
    /// Collateral owed to the caller by the host (withdrawals).
    pub collateral_out: u128,
    pub collateral: u128,
    pub effective_debt: u128,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiquidationOutcome {
    pub position_id: u64,
    /// Debt tokens burned from the liquidator (correction + penalty).
    pub debt_burned: u128,
    pub collateral_to_caller: u128,
    pub collateral_to_fee_recipient: u128,
    pub cratio_before: u128,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FullLiquidationOutcome {
    pub position_id: u64,
    /// Debt queued for socialization (position debt + reward).
    pub debt_socialized: u128,
    /// Collateral queued for socialization.
    pub collateral_socialized: u128,
    pub reward_minted: u128,
    pub cratio_before: u128,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RedemptionOutcome {
    pub debt_redeemed: u128,
    /// Collateral owed to the redeemer by the host.
    pub collateral_redeemed: u128,
    /// Collateral owed to the fee recipient by the host.
    pub collateral_to_treasury: u128,
    /// Fee percentage applied, WAD.
    pub fee_pct: u128,
    pub buckets_visited: u32,
}

// ============================================================================
// Bucket Index
// ============================================================================

/// Occupancy bitmap over rate steps: a set bit means the current-epoch
/// bucket at that step carries debt. Redemption scans it lowest-rate-first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketIndex {
    pub words: [u64; BITMAP_WORDS],
}

impl Default for BucketIndex {
    fn default() -> Self {
        Self {
            words: [0u64; BITMAP_WORDS],
        }
    }
}

impl BucketIndex {
    pub fn set(&mut self, step: u32) {
        let i = step as usize;
        if i < MAX_BUCKETS {
            self.words[i / 64] |= 1u64 << (i % 64);
        }
    }

    pub fn clear(&mut self, step: u32) {
        let i = step as usize;
        if i < MAX_BUCKETS {
            self.words[i / 64] &= !(1u64 << (i % 64));
        }
    }

    pub fn get(&self, step: u32) -> bool {
        let i = step as usize;
        i < MAX_BUCKETS && self.words[i / 64] & (1u64 << (i % 64)) != 0
    }

    /// Lowest set bit at or above `from`, or None.
    pub fn next_set_bit(&self, from: u32) -> Option<u32> {
        let start = from as usize;
        if start >= MAX_BUCKETS {
            return None;
        }
        let mut word_idx = start / 64;
        // Mask off bits below `from` in the first word.
        let mut word = self.words[word_idx] & (!0u64 << (start % 64));
        loop {
            if word != 0 {
                let bit = word_idx * 64 + word.trailing_zeros() as usize;
                if bit >= MAX_BUCKETS {
                    return None;
                }
                return Some(bit as u32);
            }
            word_idx += 1;
            if word_idx >= BITMAP_WORDS {
                return None;
            }
            word = self.words[word_idx];
        }
    }
}

// ============================================================================
// Checked Helpers
// ============================================================================

fn add_u128(a: u128, b: u128) -> Result<u128> {
    a.checked_add(b).ok_or(LedgerError::Overflow)
}

fn sub_u128(a: u128, b: u128) -> Result<u128> {
    a.checked_sub(b).ok_or(LedgerError::Overflow)
}

fn pos_delta(x: u128) -> Result<i128> {
    i128::try_from(x).map_err(|_| LedgerError::Overflow)
}

fn neg_delta(x: u128) -> Result<i128> {
    Ok(-pos_delta(x)?)
}

// ============================================================================
// Share Math
// ============================================================================
//
// Proportional-vault conversions, shared by both accounting levels (bucket
// shares against the global vault, position shares against a bucket). An
// empty vault bootstraps 1:1.

pub fn to_shares(
    assets: u128,
    total_shares: u128,
    total_assets: u128,
    rounding: Rounding,
) -> Result<u128> {
    if total_shares == 0 || total_assets == 0 {
        return Ok(assets);
    }
    mul_div(assets, total_shares, total_assets, rounding)
}

pub fn to_assets(
    shares: u128,
    total_shares: u128,
    total_assets: u128,
    rounding: Rounding,
) -> Result<u128> {
    if total_shares == 0 {
        return Ok(0);
    }
    mul_div(shares, total_assets, total_shares, rounding)
}

/// Derived debt of a bucket: its claim on the global vault, rounded up.
pub fn bucket_debt(global: &GlobalLedger, bucket: &BucketLedger) -> Result<u128> {
    to_assets(
        bucket.global_debt_shares,
        global.total_debt_shares,
        global.allocated_debt(),
        Rounding::Up,
    )
}

/// Share-derived debt of a position (includes the unamortized opening fee),
/// rounded up.
pub fn position_debt(
    global: &GlobalLedger,
    bucket: &BucketLedger,
    position: &Position,
) -> Result<u128> {
    let debt = bucket_debt(global, bucket)?;
    to_assets(
        position.debt_shares,
        bucket.total_debt_shares,
        debt,
        Rounding::Up,
    )
}

/// Unamortized opening fee: `(target - acc)+ * shares`, WAD.
pub fn outstanding_fee(bucket: &BucketLedger, position: &Position) -> Result<u128> {
    let gap = position
        .target_acc_interest
        .saturating_sub(bucket.acc_interest_per_share);
    if gap == 0 || position.debt_shares == 0 {
        return Ok(0);
    }
    mul_div(gap, position.debt_shares, WAD, Rounding::Down)
}

/// Deposit `amount` of debt into `bucket`'s vault claim: mint global shares
/// at the pre-deposit ratio and grow total debt. Other buckets' derived
/// debts are unchanged.
fn global_deposit(global: &mut GlobalLedger, bucket: &mut BucketLedger, amount: u128) -> Result<()> {
    if amount == 0 {
        return Ok(());
    }
    let shares = to_shares(
        amount,
        global.total_debt_shares,
        global.allocated_debt(),
        Rounding::Down,
    )?;
    bucket.global_debt_shares = add_u128(bucket.global_debt_shares, shares)?;
    global.total_debt_shares = add_u128(global.total_debt_shares, shares)?;
    global.total_debt = add_u128(global.total_debt, amount)?;
    Ok(())
}

/// Withdraw `amount` of debt from `bucket`'s vault claim: burn global shares
/// (rounded up, clamped to the bucket's holding) and shrink total debt.
fn global_withdraw(
    global: &mut GlobalLedger,
    bucket: &mut BucketLedger,
    amount: u128,
) -> Result<()> {
    if amount == 0 {
        return Ok(());
    }
    let shares = to_shares(
        amount,
        global.total_debt_shares,
        global.allocated_debt(),
        Rounding::Up,
    )?
    .min(bucket.global_debt_shares);
    bucket.global_debt_shares -= shares;
    global.total_debt_shares = sub_u128(global.total_debt_shares, shares)?;
    global.total_debt = sub_u128(global.total_debt, amount)?;
    Ok(())
}

/// Once a bucket has no members left, clear its residual dust claim on the
/// vault so an empty bucket always derives exactly zero debt.
fn sweep_empty_bucket(global: &mut GlobalLedger, bucket: &mut BucketLedger) -> Result<()> {
    if bucket.total_debt_shares != 0 || bucket.global_debt_shares == 0 {
        return Ok(());
    }
    let dust = to_assets(
        bucket.global_debt_shares,
        global.total_debt_shares,
        global.allocated_debt(),
        Rounding::Down,
    )?;
    global.total_debt_shares = sub_u128(global.total_debt_shares, bucket.global_debt_shares)?;
    global.total_debt = global.total_debt.saturating_sub(dust);
    bucket.global_debt_shares = 0;
    Ok(())
}

// ============================================================================
// Accrual
// ============================================================================
//
// Pure functions over value copies. Callers clone the affected records,
// accrue, and commit only on success.

/// Settle a bucket against the world: (a) pull its slice of any global
/// socialization accumulated since it last looked, then (b) accrue
/// continuously-compounded interest since `last_update_time` as a vault
/// deposit. Order matters: socialized debt pulled in (a) compounds in (b)
/// from this settlement onward, never retroactively.
fn accrue_bucket(
    global: &mut GlobalLedger,
    bucket: &mut BucketLedger,
    interest_rate: u128,
    now: u64,
) -> Result<()> {
    // (a) Socialization pull.
    if bucket.global_debt_shares > 0 {
        let debt_gap = sub_u128(
            global.acc_liquidated_debt_per_share,
            bucket.last_seen_global_liq_debt,
        )?;
        if debt_gap > 0 {
            let pulled = mul_div(debt_gap, bucket.global_debt_shares, WAD, Rounding::Down)?;
            if pulled > 0 {
                global_deposit(global, bucket, pulled)?;
                global.unrealized_liquidated_debt =
                    global.unrealized_liquidated_debt.saturating_sub(pulled);
            }
        }
        let coll_gap = sub_u128(
            global.acc_liquidated_collateral_per_share,
            bucket.last_seen_global_liq_collateral,
        )?;
        if coll_gap > 0 {
            let pulled = mul_div(coll_gap, bucket.global_debt_shares, WAD, Rounding::Down)?;
            if pulled > 0 {
                bucket.collateral = add_u128(bucket.collateral, pulled)?;
                if bucket.total_debt_shares > 0 {
                    bucket.acc_liquidated_collateral_per_share = add_u128(
                        bucket.acc_liquidated_collateral_per_share,
                        mul_div(pulled, WAD, bucket.total_debt_shares, Rounding::Down)?,
                    )?;
                }
            }
        }
    }
    bucket.last_seen_global_liq_collateral = global.acc_liquidated_collateral_per_share;
    bucket.last_seen_global_liq_debt = global.acc_liquidated_debt_per_share;

    // (b) Interest.
    let dt = now.saturating_sub(bucket.last_update_time);
    if dt > 0 {
        let debt = bucket_debt(global, bucket)?;
        if debt > 0 {
            // debt * (e^(ln(1+r) * dt/YEAR) - 1)
            let ln_growth = wad_ln(add_u128(WAD, interest_rate)?)?;
            let exponent = mul_div(ln_growth, dt as u128, YEAR_SECONDS as u128, Rounding::Down)?;
            let factor = wad_exp(exponent)?;
            let interest = mul_div(debt, sub_u128(factor, WAD)?, WAD, Rounding::Down)?;
            if interest > 0 {
                global_deposit(global, bucket, interest)?;
                if bucket.total_debt_shares > 0 {
                    bucket.acc_interest_per_share = add_u128(
                        bucket.acc_interest_per_share,
                        mul_div(interest, WAD, bucket.total_debt_shares, Rounding::Down)?,
                    )?;
                }
            }
        }
        bucket.last_update_time = now;
    }
    Ok(())
}

/// Settle a position against its (already accrued) bucket: credit its slice
/// of socialized collateral, debit its slice of redeemed collateral, and
/// refresh the snapshots. Debt needs no settlement step; it is share-derived.
fn settle_position(bucket: &BucketLedger, position: &mut Position) -> Result<()> {
    if position.debt_shares > 0 {
        let gain_gap = sub_u128(
            bucket.acc_liquidated_collateral_per_share,
            position.last_seen_bucket_liq_collateral,
        )?;
        if gain_gap > 0 {
            let gained = mul_div(gain_gap, position.debt_shares, WAD, Rounding::Down)?;
            position.collateral = add_u128(position.collateral, gained)?;
        }
        let loss_gap = sub_u128(
            bucket.acc_redeemed_collateral_per_share,
            position.last_seen_bucket_redeemed_collateral,
        )?;
        if loss_gap > 0 {
            let lost = mul_div(loss_gap, position.debt_shares, WAD, Rounding::Up)?;
            // Rounding can push the charge a hair past the balance; floor at zero.
            position.collateral = position.collateral.saturating_sub(lost);
        }
    }
    position.last_seen_bucket_liq_collateral = bucket.acc_liquidated_collateral_per_share;
    position.last_seen_bucket_redeemed_collateral = bucket.acc_redeemed_collateral_per_share;
    Ok(())
}

// ============================================================================
// The Ledger Engine
// ============================================================================

/// The accounting engine. All state is held by value; collaborators are
/// owned so a cloned engine is a complete, independent world (the flash
/// operations and the test suites rely on this).
///
/// Buckets are keyed by `(rate step, epoch)`. Retired epochs keep their
/// final record until the last stale member settles out.
#[derive(Clone, Debug, PartialEq)]
pub struct LedgerEngine<T, R, O> {
    pub params: LedgerParams,
    pub token: T,
    pub registry: R,
    pub oracle: O,
    /// Ledger clock, seconds. Advanced by the host.
    pub now: u64,
    pub global: GlobalLedger,
    pub buckets: BTreeMap<(u32, u64), BucketLedger>,
    /// Current epoch per rate step; absent means epoch 0.
    pub epochs: BTreeMap<u32, u64>,
    pub index: BucketIndex,
    pub positions: BTreeMap<u64, Position>,
    /// Collateral units held across all buckets plus socialized remainders.
    pub total_collateral: u128,
    /// Recently-redeemed amount driving the dynamic fee; decays linearly.
    pub redemption_buffer: u128,
    pub last_redemption_time: u64,
    pub flash_mint_active: bool,
    /// Exact amount (principal + fee) still owed by the live flash borrow.
    pub flash_borrow_outstanding: u128,
}

/// Fully-planned position modification, ready to commit.
struct ModifyPlan {
    global: GlobalLedger,
    index: BucketIndex,
    total_collateral: u128,
    bucket_writes: Vec<((u32, u64), BucketLedger)>,
    bucket_removes: Vec<(u32, u64)>,
    position: Position,
    remove_position: bool,
    mint_to_caller: u128,
    burn_from_caller: u128,
    outcome: ModifyOutcome,
}

impl<T: DebtToken, R: PositionRegistry, O: PriceOracle> LedgerEngine<T, R, O> {
    // ------------------------------------------------------------------
    // Construction & time
    // ------------------------------------------------------------------

    pub fn new(params: LedgerParams, token: T, registry: R, oracle: O) -> Result<Self> {
        params.validate()?;
        Ok(Self {
            params,
            token,
            registry,
            oracle,
            now: 0,
            global: GlobalLedger::default(),
            buckets: BTreeMap::new(),
            epochs: BTreeMap::new(),
            index: BucketIndex::default(),
            positions: BTreeMap::new(),
            total_collateral: 0,
            redemption_buffer: 0,
            last_redemption_time: 0,
            flash_mint_active: false,
            flash_borrow_outstanding: 0,
        })
    }

    pub fn advance_time(&mut self, dt: u64) {
        self.now = self.now.saturating_add(dt);
    }

    /// Set the clock directly. The engine expects monotonic time; a
    /// backwards jump simply accrues nothing.
    pub fn set_time(&mut self, now: u64) {
        self.now = now;
    }

    // ------------------------------------------------------------------
    // Internal utilities
    // ------------------------------------------------------------------

    /// Map a rate to its index step, validating bounds and alignment.
    fn rate_step(&self, rate: u128) -> Result<u32> {
        if rate < self.params.min_rate || rate > self.params.max_rate {
            return Err(LedgerError::RateOutOfBounds {
                rate,
                min: self.params.min_rate,
                max: self.params.max_rate,
            });
        }
        let offset = rate - self.params.min_rate;
        if offset % self.params.rate_increment != 0 {
            return Err(LedgerError::RateNotAligned {
                rate,
                increment: self.params.rate_increment,
            });
        }
        Ok((offset / self.params.rate_increment) as u32)
    }

    fn step_rate(&self, step: u32) -> u128 {
        self.params.min_rate + step as u128 * self.params.rate_increment
    }

    fn current_epoch(&self, step: u32) -> u64 {
        self.epochs.get(&step).copied().unwrap_or(0)
    }

    /// Copy of the bucket record at (step, epoch); a missing record is an
    /// empty bucket born now.
    fn bucket_copy(&self, global: &GlobalLedger, step: u32, epoch: u64) -> BucketLedger {
        self.buckets
            .get(&(step, epoch))
            .copied()
            .unwrap_or_else(|| BucketLedger::new(global, self.now))
    }

    // ------------------------------------------------------------------
    // Position lifecycle
    // ------------------------------------------------------------------

    /// Open, adjust, or close a position.
    ///
    /// `position_id` 0 mints a new position owned by the caller. A non-zero
    /// id whose record was destroyed reopens it fresh (identity reuse).
    /// `CLOSE_DELTA` in either delta means "all of it". A positive
    /// collateral delta must be matched exactly by `paid_collateral`.
    /// `permit` is forwarded to the token ledger before any repayment pull.
    ///
    /// Returns what actually happened after sentinel resolution and capping.
    pub fn modify_position(
        &mut self,
        caller: ActorId,
        position_id: u64,
        collateral_delta: i128,
        debt_delta: i128,
        interest_rate: u128,
        paid_collateral: u128,
        permit: Option<Permit>,
    ) -> Result<ModifyOutcome> {
        if let Some(p) = permit {
            self.token.approve(p.owner, self.params.ledger_actor, p.amount);
        }
        let mut plan = self.plan_modify(
            caller,
            position_id,
            collateral_delta,
            debt_delta,
            interest_rate,
            paid_collateral,
        )?;
        if plan.mint_to_caller > 0 {
            self.token.mint(caller, plan.mint_to_caller)?;
        }
        if plan.burn_from_caller > 0 {
            self.token.burn(caller, plan.burn_from_caller)?;
        }
        if position_id == 0 {
            plan.outcome.position_id = self.registry.mint(caller);
        }
        Ok(self.commit_modify(plan))
    }

    /// Same math as [`modify_position`], nothing written, no token calls.
    /// A brand-new position quotes with id 0 in the outcome.
    pub fn quote_modify_position(
        &self,
        caller: ActorId,
        position_id: u64,
        collateral_delta: i128,
        debt_delta: i128,
        interest_rate: u128,
        paid_collateral: u128,
    ) -> Result<ModifyOutcome> {
        Ok(self
            .plan_modify(
                caller,
                position_id,
                collateral_delta,
                debt_delta,
                interest_rate,
                paid_collateral,
            )?
            .outcome)
    }

    /// Compute a modification on value copies. Nothing in `self` changes.
    fn plan_modify(
        &self,
        caller: ActorId,
        position_id: u64,
        collateral_delta: i128,
        debt_delta: i128,
        interest_rate: u128,
        paid_collateral: u128,
    ) -> Result<ModifyPlan> {
        // -- request validation ------------------------------------------
        self.rate_step(interest_rate)?;
        let expected_payment = if collateral_delta > 0 {
            collateral_delta as u128
        } else {
            0
        };
        if paid_collateral != expected_payment {
            return Err(LedgerError::MismatchedCollateralPayment {
                expected: expected_payment,
                paid: paid_collateral,
            });
        }

        let existing = if position_id == 0 {
            None
        } else {
            self.positions.get(&position_id).copied()
        };
        let rate_change = existing.map_or(false, |p| p.interest_rate != interest_rate);
        if collateral_delta == 0 && debt_delta == 0 && !rate_change {
            return Err(LedgerError::ZeroAmount);
        }

        let mut required = 0u8;
        if debt_delta > 0 {
            required |= PERM_BORROW;
        }
        if debt_delta < 0 {
            required |= PERM_REPAY;
        }
        if collateral_delta > 0 {
            required |= PERM_DEPOSIT;
        }
        if collateral_delta < 0 {
            required |= PERM_WITHDRAW;
        }
        if rate_change {
            required |= PERM_ADJUST_RATE;
        }
        if position_id != 0 && !self.registry.authorized(position_id, caller, required) {
            return Err(LedgerError::NotAuthorized {
                position_id,
                required,
            });
        }

        // Withdrawals are frozen while flash-borrowed collateral is out.
        if collateral_delta < 0 && self.flash_borrow_outstanding > 0 {
            return Err(LedgerError::FlashBorrowInProgress);
        }

        let (price, stale) = self.oracle.latest_price();
        let rate_raise = existing.map_or(false, |p| interest_rate > p.interest_rate);
        let rate_lower = existing.map_or(false, |p| interest_rate < p.interest_rate);
        let risk_increasing = debt_delta > 0 || collateral_delta < 0 || rate_raise;
        // Lowering the rate realizes fee income, so it needs a live price too.
        if (risk_increasing || rate_lower) && (stale || price == 0) {
            return Err(LedgerError::InvalidCollateralPrice);
        }

        // -- state copies -------------------------------------------------
        let mut global = self.global;
        let mut index = self.index;
        let mut total_collateral = self.total_collateral;
        let mut bucket_writes: Vec<((u32, u64), BucketLedger)> = Vec::new();
        let mut bucket_removes: Vec<(u32, u64)> = Vec::new();

        let (mut pos, src_step, mut src_epoch, mut src) = match existing {
            Some(p) => {
                let step = self.rate_step(p.interest_rate)?;
                let mut b = self.bucket_copy(&global, step, p.bucket_epoch);
                accrue_bucket(&mut global, &mut b, p.interest_rate, self.now)?;
                let mut pos = p;
                settle_position(&b, &mut pos)?;
                (pos, step, p.bucket_epoch, b)
            }
            None => {
                let step = self.rate_step(interest_rate)?;
                let epoch = self.current_epoch(step);
                let mut b = self.bucket_copy(&global, step, epoch);
                accrue_bucket(&mut global, &mut b, interest_rate, self.now)?;
                (Position::new(interest_rate, epoch, &b), step, epoch, b)
            }
        };

        // A position stranded in a retired epoch carries zero debt (its
        // bucket's vault claim was fully redeemed). Move it to the live
        // epoch before applying anything, discarding the worthless shares.
        let live_epoch = self.current_epoch(src_step);
        if src_epoch < live_epoch {
            src.total_debt_shares = src.total_debt_shares.saturating_sub(pos.debt_shares);
            src.collateral = src.collateral.saturating_sub(pos.collateral);
            if src.total_debt_shares == 0 && src.collateral == 0 {
                bucket_removes.push((src_step, src_epoch));
            } else {
                bucket_writes.push(((src_step, src_epoch), src));
            }
            src_epoch = live_epoch;
            src = self.bucket_copy(&global, src_step, src_epoch);
            accrue_bucket(&mut global, &mut src, pos.interest_rate, self.now)?;
            src.collateral = add_u128(src.collateral, pos.collateral)?;
            pos.debt_shares = 0;
            pos.bucket_epoch = live_epoch;
            pos.last_seen_bucket_liq_collateral = src.acc_liquidated_collateral_per_share;
            pos.last_seen_bucket_redeemed_collateral = src.acc_redeemed_collateral_per_share;
            pos.target_acc_interest = src.acc_interest_per_share;
        }

        // -- debt leg -----------------------------------------------------
        let mut fee_owed = outstanding_fee(&src, &pos)?;
        let mut fee_dirty = false;
        let mut mint_to_caller = 0u128;
        let mut burn_from_caller = 0u128;
        let mut actual_debt_delta = 0i128;

        if debt_delta < 0 {
            let effective = position_debt(&global, &src, &pos)?;
            let requested = if debt_delta == CLOSE_DELTA {
                effective
            } else {
                debt_delta.unsigned_abs()
            };
            let amount = requested.min(effective);
            if amount > 0 {
                // Realize the proportional slice of the outstanding fee:
                // that slice converts to fee income instead of debt burned.
                let realized = mul_div(amount, fee_owed, effective, Rounding::Down)?;
                let share_burn = if amount == effective {
                    pos.debt_shares
                } else {
                    to_shares(
                        amount,
                        src.total_debt_shares,
                        bucket_debt(&global, &src)?,
                        Rounding::Down,
                    )?
                    .min(pos.debt_shares)
                };
                pos.debt_shares -= share_burn;
                src.total_debt_shares -= share_burn;
                global_withdraw(&mut global, &mut src, amount)?;
                if realized > 0 {
                    global.total_debt = add_u128(global.total_debt, realized)?;
                    global.pending_fees = add_u128(global.pending_fees, realized)?;
                }
                sweep_empty_bucket(&mut global, &mut src)?;
                fee_owed -= realized;
                fee_dirty = true;
                burn_from_caller = amount;
                actual_debt_delta = neg_delta(amount)?;
            }
        } else if debt_delta > 0 {
            let amount = debt_delta as u128;
            let fee = wad_mul(amount, self.params.opening_fee_pct, Rounding::Up)?;
            let assigned = add_u128(amount, fee)?;
            let share_mint = to_shares(
                assigned,
                src.total_debt_shares,
                bucket_debt(&global, &src)?,
                Rounding::Up,
            )?;
            pos.debt_shares = add_u128(pos.debt_shares, share_mint)?;
            src.total_debt_shares = add_u128(src.total_debt_shares, share_mint)?;
            global_deposit(&mut global, &mut src, assigned)?;
            fee_owed = add_u128(fee_owed, fee)?;
            fee_dirty = true;
            mint_to_caller = amount;
            actual_debt_delta = pos_delta(amount)?;
        }

        // -- collateral leg -----------------------------------------------
        let mut actual_collateral_delta = 0i128;
        let mut collateral_out = 0u128;
        if collateral_delta > 0 {
            let amount = collateral_delta as u128;
            pos.collateral = add_u128(pos.collateral, amount)?;
            src.collateral = add_u128(src.collateral, amount)?;
            total_collateral = add_u128(total_collateral, amount)?;
            actual_collateral_delta = collateral_delta;
        } else if collateral_delta < 0 {
            let requested = if collateral_delta == CLOSE_DELTA {
                pos.collateral
            } else {
                collateral_delta.unsigned_abs()
            };
            let amount = requested.min(pos.collateral);
            pos.collateral -= amount;
            src.collateral = src.collateral.saturating_sub(amount);
            total_collateral = sub_u128(total_collateral, amount)?;
            collateral_out = amount;
            actual_collateral_delta = neg_delta(amount)?;
        }

        // -- bucket migration ----------------------------------------------
        let mut dst_write: Option<((u32, u64), BucketLedger)> = None;
        if interest_rate != pos.interest_rate {
            let dst_step = self.rate_step(interest_rate)?;
            // Dropping to a cheaper bucket realizes the whole fee now;
            // raising carries it along.
            if interest_rate < pos.interest_rate && fee_owed > 0 {
                let effective = position_debt(&global, &src, &pos)?;
                let realized = fee_owed.min(effective);
                let share_burn = if realized == effective {
                    pos.debt_shares
                } else {
                    to_shares(
                        realized,
                        src.total_debt_shares,
                        bucket_debt(&global, &src)?,
                        Rounding::Down,
                    )?
                    .min(pos.debt_shares)
                };
                pos.debt_shares -= share_burn;
                src.total_debt_shares -= share_burn;
                global_withdraw(&mut global, &mut src, realized)?;
                global.total_debt = add_u128(global.total_debt, realized)?;
                global.pending_fees = add_u128(global.pending_fees, realized)?;
                sweep_empty_bucket(&mut global, &mut src)?;
                fee_owed = 0;
            }

            let moved = position_debt(&global, &src, &pos)?;
            src.total_debt_shares = sub_u128(src.total_debt_shares, pos.debt_shares)?;
            global_withdraw(&mut global, &mut src, moved)?;
            sweep_empty_bucket(&mut global, &mut src)?;
            src.collateral = src.collateral.saturating_sub(pos.collateral);

            let dst_epoch = self.current_epoch(dst_step);
            let mut dst = self.bucket_copy(&global, dst_step, dst_epoch);
            accrue_bucket(&mut global, &mut dst, interest_rate, self.now)?;
            let share_mint = to_shares(
                moved,
                dst.total_debt_shares,
                bucket_debt(&global, &dst)?,
                Rounding::Up,
            )?;
            global_deposit(&mut global, &mut dst, moved)?;
            dst.total_debt_shares = add_u128(dst.total_debt_shares, share_mint)?;
            dst.collateral = add_u128(dst.collateral, pos.collateral)?;
            pos.debt_shares = share_mint;
            pos.interest_rate = interest_rate;
            pos.bucket_epoch = dst_epoch;
            pos.last_seen_bucket_liq_collateral = dst.acc_liquidated_collateral_per_share;
            pos.last_seen_bucket_redeemed_collateral = dst.acc_redeemed_collateral_per_share;
            fee_dirty = true;

            let dst_debt_now = bucket_debt(&global, &dst)?;
            if dst_debt_now > 0 {
                index.set(dst_step);
            } else {
                index.clear(dst_step);
            }
            dst_write = Some(((dst_step, dst_epoch), dst));
        }

        // -- fee amortization mark ------------------------------------------
        let final_bucket = dst_write.as_ref().map(|(_, b)| b).unwrap_or(&src);
        if fee_dirty {
            pos.target_acc_interest = if pos.debt_shares > 0 && fee_owed > 0 {
                add_u128(
                    final_bucket.acc_interest_per_share,
                    mul_div(fee_owed, WAD, pos.debt_shares, Rounding::Up)?,
                )?
            } else {
                final_bucket.acc_interest_per_share
            };
        }

        // -- index maintenance ----------------------------------------------
        // `src` is the live epoch at its step by now; retired records never
        // touch the index.
        let src_debt_now = bucket_debt(&global, &src)?;
        if src_debt_now > 0 {
            index.set(src_step);
        } else {
            index.clear(src_step);
        }

        // -- minimums & risk --------------------------------------------------
        let effective_debt = position_debt(&global, final_bucket, &pos)?;
        if effective_debt > 0 && effective_debt < self.params.min_debt {
            return Err(LedgerError::BelowMinimumDebt {
                debt: effective_debt,
                min: self.params.min_debt,
            });
        }
        if pos.collateral > 0 && pos.collateral < self.params.min_collateral {
            return Err(LedgerError::BelowMinimumCollateral {
                collateral: pos.collateral,
                min: self.params.min_collateral,
            });
        }

        if risk_increasing {
            if effective_debt > 0 {
                let coll_value = wad_mul(pos.collateral, price, Rounding::Down)?;
                let required = wad_mul(effective_debt, self.params.issuance_ratio, Rounding::Up)?;
                if coll_value < required {
                    return Err(LedgerError::PositionUndercollateralized {
                        cratio: wad_div(coll_value, effective_debt, Rounding::Down)?,
                        required: self.params.issuance_ratio,
                    });
                }
            }
            let sys_debt = add_u128(global.total_debt, global.unrealized_liquidated_debt)?;
            if sys_debt > 0 {
                let sys_coll_value = wad_mul(total_collateral, price, Rounding::Down)?;
                let sys_required = wad_mul(sys_debt, self.params.issuance_ratio, Rounding::Up)?;
                if sys_coll_value < sys_required {
                    return Err(LedgerError::SystemUndercollateralized {
                        cratio: wad_div(sys_coll_value, sys_debt, Rounding::Down)?,
                        required: self.params.issuance_ratio,
                    });
                }
            }
        }

        // -- assemble --------------------------------------------------------
        let remove_position = pos.debt_shares == 0 && pos.collateral == 0;
        bucket_writes.push(((src_step, src_epoch), src));
        if let Some(w) = dst_write {
            bucket_writes.push(w);
        }

        Ok(ModifyPlan {
            global,
            index,
            total_collateral,
            bucket_writes,
            bucket_removes,
            position: pos,
            remove_position,
            mint_to_caller,
            burn_from_caller,
            outcome: ModifyOutcome {
                position_id,
                actual_collateral_delta,
                actual_debt_delta,
                collateral_out,
                collateral: pos.collateral,
                effective_debt,
            },
        })
    }

    fn commit_modify(&mut self, plan: ModifyPlan) -> ModifyOutcome {
        self.global = plan.global;
        self.index = plan.index;
        self.total_collateral = plan.total_collateral;
        for (key, bucket) in plan.bucket_writes {
            self.buckets.insert(key, bucket);
        }
        for key in plan.bucket_removes {
            self.buckets.remove(&key);
        }
        if plan.remove_position {
            self.positions.remove(&plan.outcome.position_id);
        } else {
            self.positions.insert(plan.outcome.position_id, plan.position);
        }
        plan.outcome
    }

    /// Settle a position (and its bucket) without changing anything else.
    /// Permissionless: settlement is always safe to force.
    pub fn update_position(&mut self, position_id: u64) -> Result<()> {
        let stored = self
            .positions
            .get(&position_id)
            .copied()
            .ok_or(LedgerError::UnknownPosition { position_id })?;
        let step = self.rate_step(stored.interest_rate)?;
        let key = (step, stored.bucket_epoch);
        let mut global = self.global;
        let mut bucket = self.bucket_copy(&global, step, stored.bucket_epoch);
        accrue_bucket(&mut global, &mut bucket, stored.interest_rate, self.now)?;
        let mut pos = stored;
        settle_position(&bucket, &mut pos)?;

        self.global = global;
        self.buckets.insert(key, bucket);
        self.positions.insert(position_id, pos);
        Ok(())
    }

    /// Settle the live bucket at `interest_rate` without touching members.
    /// A rate nobody occupies settles to nothing.
    pub fn update_bucket(&mut self, interest_rate: u128) -> Result<()> {
        let step = self.rate_step(interest_rate)?;
        let epoch = self.current_epoch(step);
        if !self.buckets.contains_key(&(step, epoch)) {
            return Ok(());
        }
        let mut global = self.global;
        let mut bucket = self.bucket_copy(&global, step, epoch);
        accrue_bucket(&mut global, &mut bucket, interest_rate, self.now)?;
        self.global = global;
        self.buckets.insert((step, epoch), bucket);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Liquidation
    // ------------------------------------------------------------------

    /// Partially liquidate an undercollateralized position, burning just
    /// enough debt from the caller to restore it to the issuance ratio.
    ///
    /// The caller burns `amountToFix + penalty` and receives the matching
    /// collateral plus a capped slice of the penalty collateral; the rest of
    /// the penalty collateral goes to the fee recipient.
    pub fn liquidate(
        &mut self,
        caller: ActorId,
        position_id: u64,
        permit: Option<Permit>,
    ) -> Result<LiquidationOutcome> {
        if self.flash_mint_active {
            return Err(LedgerError::FlashMintInProgress);
        }
        if self.flash_borrow_outstanding > 0 {
            return Err(LedgerError::FlashBorrowInProgress);
        }
        if let Some(p) = permit {
            self.token.approve(p.owner, self.params.ledger_actor, p.amount);
        }
        let (price, stale) = self.oracle.latest_price();
        if stale || price == 0 {
            return Err(LedgerError::InvalidCollateralPrice);
        }

        let stored = self
            .positions
            .get(&position_id)
            .copied()
            .ok_or(LedgerError::UnknownPosition { position_id })?;
        let step = self.rate_step(stored.interest_rate)?;
        let key = (step, stored.bucket_epoch);
        let mut global = self.global;
        let mut bucket = self.bucket_copy(&global, step, stored.bucket_epoch);
        accrue_bucket(&mut global, &mut bucket, stored.interest_rate, self.now)?;
        let mut pos = stored;
        settle_position(&bucket, &mut pos)?;

        let debt = position_debt(&global, &bucket, &pos)?;
        let coll_value = wad_mul(pos.collateral, price, Rounding::Down)?;
        let cratio = if debt == 0 {
            u128::MAX
        } else {
            wad_div(coll_value, debt, Rounding::Down)?
        };
        if cratio > self.params.liquidation_ratio {
            return Err(LedgerError::NotEligibleForLiquidation {
                cratio,
                threshold: self.params.liquidation_ratio,
            });
        }

        // amountToFix = (debt * IR - collValue) / (IR - 1); burning it plus
        // removing the matching collateral lands the ratio exactly on IR.
        let ir = self.params.issuance_ratio;
        let shortfall = wad_mul(debt, ir, Rounding::Up)?.saturating_sub(coll_value);
        let amount_to_fix = mul_div(shortfall, WAD, sub_u128(ir, WAD)?, Rounding::Up)?;
        let penalty = wad_mul(amount_to_fix, self.params.liquidation_penalty_pct, Rounding::Down)?;
        let burn_total = add_u128(amount_to_fix, penalty)?;
        // Deep underwater positions can demand more than the debt or the
        // collateral can cover; those take the full-liquidation path.
        if burn_total > debt {
            return Err(LedgerError::InsufficientCollateral);
        }
        let collateral_to_redeem = wad_div(amount_to_fix, price, Rounding::Down)?;
        // Penalty collateral is IR-weighted so its removal keeps the fix exact.
        let penalty_collateral = mul_div(penalty, ir, price, Rounding::Down)?;
        let collateral_removed = add_u128(collateral_to_redeem, penalty_collateral)?;
        if collateral_removed > pos.collateral {
            return Err(LedgerError::InsufficientCollateral);
        }
        let reward_cap = wad_div(self.params.max_liquidation_reward, price, Rounding::Down)?;
        let reward = wad_mul(
            penalty_collateral,
            self.params.liquidation_reward_pct,
            Rounding::Down,
        )?
        .min(reward_cap);
        let collateral_to_caller = add_u128(collateral_to_redeem, reward)?;
        let collateral_to_fee_recipient = sub_u128(penalty_collateral, reward)?;

        // The burn realizes its slice of the outstanding fee like any repay.
        let fee_owed = outstanding_fee(&bucket, &pos)?;
        let realized = mul_div(burn_total, fee_owed, debt, Rounding::Down)?;
        let share_burn = if burn_total == debt {
            pos.debt_shares
        } else {
            to_shares(
                burn_total,
                bucket.total_debt_shares,
                bucket_debt(&global, &bucket)?,
                Rounding::Down,
            )?
            .min(pos.debt_shares)
        };
        pos.debt_shares -= share_burn;
        bucket.total_debt_shares -= share_burn;
        global_withdraw(&mut global, &mut bucket, burn_total)?;
        if realized > 0 {
            global.total_debt = add_u128(global.total_debt, realized)?;
            global.pending_fees = add_u128(global.pending_fees, realized)?;
        }
        sweep_empty_bucket(&mut global, &mut bucket)?;
        let fee_left = fee_owed - realized;
        pos.target_acc_interest = if pos.debt_shares > 0 && fee_left > 0 {
            add_u128(
                bucket.acc_interest_per_share,
                mul_div(fee_left, WAD, pos.debt_shares, Rounding::Up)?,
            )?
        } else {
            bucket.acc_interest_per_share
        };

        pos.collateral = sub_u128(pos.collateral, collateral_removed)?;
        bucket.collateral = bucket.collateral.saturating_sub(collateral_removed);
        let total_collateral = sub_u128(self.total_collateral, collateral_removed)?;

        let mut index = self.index;
        if stored.bucket_epoch == self.current_epoch(step) {
            if bucket_debt(&global, &bucket)? > 0 {
                index.set(step);
            } else {
                index.clear(step);
            }
        }

        self.token.burn(caller, burn_total)?;

        self.global = global;
        self.index = index;
        self.total_collateral = total_collateral;
        self.buckets.insert(key, bucket);
        if pos.debt_shares == 0 && pos.collateral == 0 {
            self.positions.remove(&position_id);
        } else {
            self.positions.insert(position_id, pos);
        }
        Ok(LiquidationOutcome {
            position_id,
            debt_burned: burn_total,
            collateral_to_caller,
            collateral_to_fee_recipient,
            cratio_before: cratio,
        })
    }

    /// Fully liquidate a critically undercollateralized position: its debt
    /// (plus a fixed freshly-minted reward) and collateral are socialized
    /// across all remaining debt via the global accumulators.
    pub fn full_liquidate(&mut self, caller: ActorId, position_id: u64) -> Result<FullLiquidationOutcome> {
        if self.flash_mint_active {
            return Err(LedgerError::FlashMintInProgress);
        }
        if self.flash_borrow_outstanding > 0 {
            return Err(LedgerError::FlashBorrowInProgress);
        }
        let (price, stale) = self.oracle.latest_price();
        if stale || price == 0 {
            return Err(LedgerError::InvalidCollateralPrice);
        }

        let stored = self
            .positions
            .get(&position_id)
            .copied()
            .ok_or(LedgerError::UnknownPosition { position_id })?;
        let step = self.rate_step(stored.interest_rate)?;
        let key = (step, stored.bucket_epoch);
        let mut global = self.global;
        let mut bucket = self.bucket_copy(&global, step, stored.bucket_epoch);
        accrue_bucket(&mut global, &mut bucket, stored.interest_rate, self.now)?;
        let mut pos = stored;
        settle_position(&bucket, &mut pos)?;

        let debt = position_debt(&global, &bucket, &pos)?;
        let coll_value = wad_mul(pos.collateral, price, Rounding::Down)?;
        let cratio = if debt == 0 {
            u128::MAX
        } else {
            wad_div(coll_value, debt, Rounding::Down)?
        };
        if cratio > self.params.full_liquidation_ratio {
            return Err(LedgerError::NotEligibleForFullLiquidation {
                cratio,
                threshold: self.params.full_liquidation_ratio,
            });
        }

        // Remove the position from its bucket entirely.
        let seized_collateral = pos.collateral;
        bucket.total_debt_shares = sub_u128(bucket.total_debt_shares, pos.debt_shares)?;
        global_withdraw(&mut global, &mut bucket, debt)?;
        sweep_empty_bucket(&mut global, &mut bucket)?;
        bucket.collateral = bucket.collateral.saturating_sub(seized_collateral);

        // Socialize against the post-removal share supply so the removed
        // position never participates in its own loss.
        let reward = self.params.full_liquidation_reward;
        let socialized_debt = add_u128(debt, reward)?;
        let supply = global.total_debt_shares;
        global.unrealized_liquidated_debt =
            add_u128(global.unrealized_liquidated_debt, socialized_debt)?;
        if supply > 0 {
            global.acc_liquidated_debt_per_share = add_u128(
                global.acc_liquidated_debt_per_share,
                mul_div(socialized_debt, WAD, supply, Rounding::Down)?,
            )?;
            if seized_collateral > 0 {
                global.acc_liquidated_collateral_per_share = add_u128(
                    global.acc_liquidated_collateral_per_share,
                    mul_div(seized_collateral, WAD, supply, Rounding::Down)?,
                )?;
            }
        }
        // With no shares left the loss stays parked in
        // unrealized_liquidated_debt and the collateral in total_collateral.

        let mut index = self.index;
        if stored.bucket_epoch == self.current_epoch(step) {
            if bucket_debt(&global, &bucket)? > 0 {
                index.set(step);
            } else {
                index.clear(step);
            }
        }

        self.token.mint(caller, reward)?;

        self.global = global;
        self.index = index;
        self.buckets.insert(key, bucket);
        self.positions.remove(&position_id);
        Ok(FullLiquidationOutcome {
            position_id,
            debt_socialized: socialized_debt,
            collateral_socialized: seized_collateral,
            reward_minted: reward,
            cratio_before: cratio,
        })
    }

    // ------------------------------------------------------------------
    // Redemption
    // ------------------------------------------------------------------

    /// Burn debt tokens against the system's cheapest debt, receiving
    /// collateral at oracle price minus the dynamic fee.
    ///
    /// Buckets are consumed lowest rate first. Insolvent buckets are
    /// skipped (their index bit stays set). A bucket redeemed to exactly
    /// zero debt retires: its epoch advances and stale members settle to
    /// zero debt lazily. If the rate axis is exhausted before `amount` is
    /// sourced the whole redemption fails. The collateral paid out must be
    /// positive and at least `min_collateral_out`.
    pub fn redeem(
        &mut self,
        caller: ActorId,
        amount: u128,
        min_collateral_out: u128,
        permit: Option<Permit>,
    ) -> Result<RedemptionOutcome> {
        if self.flash_mint_active {
            return Err(LedgerError::FlashMintInProgress);
        }
        if self.flash_borrow_outstanding > 0 {
            return Err(LedgerError::FlashBorrowInProgress);
        }
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        if let Some(p) = permit {
            self.token.approve(p.owner, self.params.ledger_actor, p.amount);
        }
        let (price, stale) = self.oracle.latest_price();
        if stale || price == 0 {
            return Err(LedgerError::InvalidCollateralPrice);
        }

        // Fee percentage is fixed up front from pre-redemption totals.
        let decayed_buffer = self.decayed_buffer()?;
        let fee_pct =
            Self::redemption_fee_pct(&self.params, decayed_buffer, self.global.total_debt, amount)?;
        let keep_pct = sub_u128(WAD, fee_pct)?;
        let treasury_pct = fee_pct.min(self.params.redemption_treasury_threshold);
        // Computed here so the commit below stays infallible.
        let buffer_after = add_u128(decayed_buffer, amount)?;

        let mut global = self.global;
        let mut index = self.index;
        let mut total_collateral = self.total_collateral;
        let mut bucket_writes: Vec<((u32, u64), BucketLedger)> = Vec::new();
        let mut epoch_bumps: Vec<(u32, u64)> = Vec::new();

        let mut remaining = amount;
        let mut to_redeemer = 0u128;
        let mut to_treasury = 0u128;
        let mut buckets_visited = 0u32;
        let mut cursor = 0u32;

        while remaining > 0 {
            let step = match index.next_set_bit(cursor) {
                Some(s) => s,
                None => break,
            };
            cursor = step + 1;
            let epoch = self.current_epoch(step);
            let rate = self.step_rate(step);
            let mut bucket = self.bucket_copy(&global, step, epoch);
            accrue_bucket(&mut global, &mut bucket, rate, self.now)?;
            buckets_visited += 1;

            let debt = bucket_debt(&global, &bucket)?;
            if debt == 0 {
                // Index hygiene: stale bit over an empty live bucket.
                index.clear(step);
                bucket_writes.push(((step, epoch), bucket));
                continue;
            }
            // An insolvent bucket is skipped, bit intact: it comes back
            // into redemption scope if the price recovers.
            let bucket_coll_value = wad_mul(bucket.collateral, price, Rounding::Down)?;
            if bucket_coll_value < debt {
                bucket_writes.push(((step, epoch), bucket));
                continue;
            }

            let take = remaining.min(debt);
            let gross = wad_div(take, price, Rounding::Down)?;
            let redeemer_cut = wad_mul(gross, keep_pct, Rounding::Down)?;
            let treasury_cut = wad_mul(gross, treasury_pct, Rounding::Down)?;
            let outflow = add_u128(redeemer_cut, treasury_cut)?;
            // Solvency bounds outflow: outflow <= gross <= collateral.
            bucket.collateral = sub_u128(bucket.collateral, outflow)?;
            if bucket.total_debt_shares > 0 {
                bucket.acc_redeemed_collateral_per_share = add_u128(
                    bucket.acc_redeemed_collateral_per_share,
                    mul_div(outflow, WAD, bucket.total_debt_shares, Rounding::Down)?,
                )?;
            }
            global_withdraw(&mut global, &mut bucket, take)?;
            if take == debt {
                // Exactly-zero debt retires this epoch. Force out any
                // residual dust claim so stale members derive zero.
                if bucket.global_debt_shares > 0 {
                    let dust = to_assets(
                        bucket.global_debt_shares,
                        global.total_debt_shares,
                        global.allocated_debt(),
                        Rounding::Down,
                    )?;
                    global.total_debt_shares =
                        sub_u128(global.total_debt_shares, bucket.global_debt_shares)?;
                    global.total_debt = global.total_debt.saturating_sub(dust);
                    bucket.global_debt_shares = 0;
                }
                epoch_bumps.push((step, epoch + 1));
                index.clear(step);
            }
            to_redeemer = add_u128(to_redeemer, redeemer_cut)?;
            to_treasury = add_u128(to_treasury, treasury_cut)?;
            total_collateral = sub_u128(total_collateral, outflow)?;
            remaining -= take;
            bucket_writes.push(((step, epoch), bucket));
        }

        if remaining > 0 {
            return Err(LedgerError::InsufficientCollateral);
        }
        if to_redeemer == 0 || to_redeemer < min_collateral_out {
            return Err(LedgerError::MinAmountOutNotMet {
                actual: to_redeemer,
                min: min_collateral_out,
            });
        }

        self.token.burn(caller, amount)?;

        self.global = global;
        self.index = index;
        self.total_collateral = total_collateral;
        for (k, b) in bucket_writes {
            self.buckets.insert(k, b);
        }
        for (step, epoch) in epoch_bumps {
            self.epochs.insert(step, epoch);
        }
        self.redemption_buffer = buffer_after;
        self.last_redemption_time = self.now;
        Ok(RedemptionOutcome {
            debt_redeemed: amount,
            collateral_redeemed: to_redeemer,
            collateral_to_treasury: to_treasury,
            fee_pct,
            buckets_visited,
        })
    }

    /// Fee percentage a redemption of `amount` would pay right now.
    pub fn get_redemption_fee(&self, amount: u128) -> Result<u128> {
        Self::redemption_fee_pct(
            &self.params,
            self.decayed_buffer()?,
            self.global.total_debt,
            amount,
        )
    }

    /// Redemption buffer after linear decay since the last redemption.
    fn decayed_buffer(&self) -> Result<u128> {
        let dt = self.now.saturating_sub(self.last_redemption_time);
        let period = self.params.redemption_decay_period;
        if dt >= period {
            return Ok(0);
        }
        mul_div(
            self.redemption_buffer,
            (period - dt) as u128,
            period as u128,
            Rounding::Down,
        )
    }

    /// fee = f_min + K * [(buffer + T) * ln(T / (T - a)) - a] / a, clamped
    /// to 100%. Redeeming at or past the whole debt pays the full clamp.
    fn redemption_fee_pct(
        params: &LedgerParams,
        buffer: u128,
        total_debt: u128,
        amount: u128,
    ) -> Result<u128> {
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        if total_debt == 0 || amount >= total_debt {
            return Ok(WAD);
        }
        match Self::fee_curve(params, buffer, total_debt, amount) {
            Ok(fee) => Ok(fee.min(WAD)),
            // Extreme inputs blow past u128 before the clamp would apply.
            Err(LedgerError::Overflow) => Ok(WAD),
            Err(e) => Err(e),
        }
    }

    fn fee_curve(
        params: &LedgerParams,
        buffer: u128,
        total_debt: u128,
        amount: u128,
    ) -> Result<u128> {
        let ratio = mul_div(total_debt, WAD, total_debt - amount, Rounding::Down)?;
        let ln_term = wad_ln(ratio)?;
        let inner = wad_mul(add_u128(buffer, total_debt)?, ln_term, Rounding::Down)?
            .saturating_sub(amount);
        add_u128(
            params.redemption_base_fee,
            mul_div(params.redemption_fee_scalar, inner, amount, Rounding::Down)?,
        )
    }

    // ------------------------------------------------------------------
    // Fees & Views
    // ------------------------------------------------------------------

    /// Mint accumulated fee income to the fee recipient and clear it.
    /// Conservation holds term by term: pending_fees and total_debt drop
    /// together, bucket claims untouched.
    pub fn collect_fees(&mut self) -> Result<u128> {
        let fees = self.global.pending_fees;
        if fees == 0 {
            return Ok(0);
        }
        self.token.mint(self.params.fee_recipient, fees)?;
        self.global.pending_fees = 0;
        self.global.total_debt = sub_u128(self.global.total_debt, fees)?;
        Ok(fees)
    }

    /// Settled snapshot of a position. Read-only.
    pub fn position_state(&self, position_id: u64) -> Result<PositionState> {
        let stored = self
            .positions
            .get(&position_id)
            .copied()
            .ok_or(LedgerError::UnknownPosition { position_id })?;
        let step = self.rate_step(stored.interest_rate)?;
        let mut global = self.global;
        let mut bucket = self.bucket_copy(&global, step, stored.bucket_epoch);
        accrue_bucket(&mut global, &mut bucket, stored.interest_rate, self.now)?;
        let mut pos = stored;
        settle_position(&bucket, &mut pos)?;
        let effective_debt = position_debt(&global, &bucket, &pos)?;
        let fee = outstanding_fee(&bucket, &pos)?.min(effective_debt);
        Ok(PositionState {
            position_id,
            collateral: pos.collateral,
            debt: effective_debt - fee,
            outstanding_fee: fee,
            effective_debt,
            interest_rate: pos.interest_rate,
            bucket_epoch: pos.bucket_epoch,
            debt_shares: pos.debt_shares,
        })
    }

    /// Settled snapshot of the live bucket at `interest_rate`. Read-only.
    pub fn bucket_state(&self, interest_rate: u128) -> Result<BucketState> {
        let step = self.rate_step(interest_rate)?;
        let epoch = self.current_epoch(step);
        let mut global = self.global;
        let mut bucket = self.bucket_copy(&global, step, epoch);
        accrue_bucket(&mut global, &mut bucket, interest_rate, self.now)?;
        Ok(BucketState {
            interest_rate,
            epoch,
            debt: bucket_debt(&global, &bucket)?,
            collateral: bucket.collateral,
            total_debt_shares: bucket.total_debt_shares,
            global_debt_shares: bucket.global_debt_shares,
            acc_interest_per_share: bucket.acc_interest_per_share,
            acc_liquidated_collateral_per_share: bucket.acc_liquidated_collateral_per_share,
            acc_redeemed_collateral_per_share: bucket.acc_redeemed_collateral_per_share,
            last_update_time: bucket.last_update_time,
        })
    }

    pub fn global_state(&self) -> GlobalState {
        GlobalState {
            total_debt: self.global.total_debt,
            total_debt_shares: self.global.total_debt_shares,
            pending_fees: self.global.pending_fees,
            unrealized_liquidated_debt: self.global.unrealized_liquidated_debt,
            acc_liquidated_collateral_per_share: self.global.acc_liquidated_collateral_per_share,
            acc_liquidated_debt_per_share: self.global.acc_liquidated_debt_per_share,
            total_collateral: self.total_collateral,
            redemption_buffer: self.redemption_buffer,
            last_redemption_time: self.last_redemption_time,
            flash_mint_active: self.flash_mint_active,
            flash_borrow_outstanding: self.flash_borrow_outstanding,
            now: self.now,
        }
    }

    pub fn config(&self) -> &LedgerParams {
        &self.params
    }

    // ------------------------------------------------------------------
    // Audit
    // ------------------------------------------------------------------

    /// Settle a copy of the whole world and verify that total debt equals
    /// the sum of position debts plus pending fees, to within rounding
    /// dust. O(positions): a test and operations tool, not a hot path.
    pub fn check_debt_conservation(&self) -> bool {
        let mut global = self.global;
        let mut settled: BTreeMap<(u32, u64), BucketLedger> = BTreeMap::new();
        for (key, bucket) in &self.buckets {
            let mut b = *bucket;
            let rate = self.step_rate(key.0);
            if accrue_bucket(&mut global, &mut b, rate, self.now).is_err() {
                return false;
            }
            settled.insert(*key, b);
        }
        let mut debt_sum: u128 = 0;
        for pos in self.positions.values() {
            let step = match self.rate_step(pos.interest_rate) {
                Ok(s) => s,
                Err(_) => return false,
            };
            match settled.get(&(step, pos.bucket_epoch)) {
                Some(bucket) => match position_debt(&global, bucket, pos) {
                    Ok(d) => debt_sum = debt_sum.saturating_add(d),
                    Err(_) => return false,
                },
                // A member may only outlive its bucket record with nothing
                // at stake.
                None => {
                    if pos.debt_shares != 0 {
                        return false;
                    }
                }
            }
        }
        let expected = debt_sum.saturating_add(global.pending_fees);
        let actual = global.total_debt;
        let slack = actual / 1_000_000_000_000
            + 4 * (self.positions.len() as u128 + self.buckets.len() as u128)
            + 4;
        actual.abs_diff(expected) <= slack
    }

    /// Structural consistency of the share ledgers and the index.
    /// O(positions).
    pub fn check_share_consistency(&self) -> bool {
        // Wei of derived debt an index bit is allowed to lag behind.
        const INDEX_DUST: u128 = 4;

        let mut bucket_share_sum: u128 = 0;
        for bucket in self.buckets.values() {
            bucket_share_sum = bucket_share_sum.saturating_add(bucket.global_debt_shares);
        }
        if bucket_share_sum != self.global.total_debt_shares {
            return false;
        }

        let mut member_sums: BTreeMap<(u32, u64), u128> = BTreeMap::new();
        for pos in self.positions.values() {
            let step = match self.rate_step(pos.interest_rate) {
                Ok(s) => s,
                Err(_) => return false,
            };
            let entry = member_sums.entry((step, pos.bucket_epoch)).or_insert(0);
            *entry = entry.saturating_add(pos.debt_shares);
        }
        for (key, bucket) in &self.buckets {
            if member_sums.get(key).copied().unwrap_or(0) != bucket.total_debt_shares {
                return false;
            }
        }
        for (key, sum) in &member_sums {
            if *sum > 0 && !self.buckets.contains_key(key) {
                return false;
            }
        }

        // A set bit must point at a live bucket with debt; live debt above
        // dust must be indexed.
        let mut cursor = 0u32;
        while let Some(step) = self.index.next_set_bit(cursor) {
            cursor = step + 1;
            let epoch = self.current_epoch(step);
            match self.buckets.get(&(step, epoch)) {
                None => return false,
                Some(b) => match bucket_debt(&self.global, b) {
                    Ok(d) => {
                        if d == 0 {
                            return false;
                        }
                    }
                    Err(_) => return false,
                },
            }
        }
        for (key, bucket) in &self.buckets {
            if key.1 != self.current_epoch(key.0) {
                continue;
            }
            match bucket_debt(&self.global, bucket) {
                Ok(d) => {
                    if d > INDEX_DUST && !self.index.get(key.0) {
                        return false;
                    }
                }
                Err(_) => return false,
            }
        }
        true
    }

    /// Repay part or all of an outstanding flash borrow. Valid only inside
    /// a flash-borrow callback; over-repayment is rejected.
    pub fn repay_flash_borrow(&mut self, amount: u128) -> Result<()> {
        if self.flash_borrow_outstanding == 0 {
            return Err(LedgerError::NoFlashBorrowOutstanding);
        }
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        if amount > self.flash_borrow_outstanding {
            return Err(LedgerError::MismatchedCollateralPayment {
                expected: self.flash_borrow_outstanding,
                paid: amount,
            });
        }
        self.flash_borrow_outstanding -= amount;
        self.total_collateral = add_u128(self.total_collateral, amount)?;
        Ok(())
    }
}

// ============================================================================
// Flash Operations
// ============================================================================
//
// Flash operations wrap a callback that may legitimately re-enter the
// engine, so copy-then-commit cannot cover them: the callback's nested
// operations commit for real. Instead the whole engine (collaborators
// included, hence the Clone bounds) is snapshotted up front and restored on
// any failure, which is exactly transaction semantics: an aborted flash
// operation takes its nested operations down with it.

impl<T, R, O> LedgerEngine<T, R, O>
where
    T: DebtToken + Clone,
    R: PositionRegistry + Clone,
    O: PriceOracle + Clone,
{
    /// Mint `amount` to `recipient`, run the callback, then burn the
    /// principal back and forward the fee to the fee recipient. Returns the
    /// fee charged.
    ///
    /// While active: liquidation, full liquidation, redemption, and nested
    /// flash operations are rejected; position modification stays open.
    pub fn flash_mint(
        &mut self,
        caller: ActorId,
        recipient: ActorId,
        amount: u128,
        data: &[u8],
        receiver: &mut dyn FlashLoanReceiver<T, R, O>,
    ) -> Result<u128> {
        if self.flash_mint_active {
            return Err(LedgerError::FlashMintInProgress);
        }
        if self.flash_borrow_outstanding > 0 {
            return Err(LedgerError::FlashBorrowInProgress);
        }
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        let fee = wad_mul(amount, self.params.flash_mint_fee_pct, Rounding::Up)?;
        let snapshot = self.clone();
        self.flash_mint_active = true;
        if let Err(e) = self.token.mint(recipient, amount) {
            *self = snapshot;
            return Err(e.into());
        }
        if !receiver.execute_operation(self, FlashAsset::DebtToken, amount, fee, caller, data) {
            *self = snapshot;
            return Err(LedgerError::OperationFailed);
        }
        if let Err(e) = self.token.burn(recipient, amount) {
            *self = snapshot;
            return Err(e.into());
        }
        if fee > 0 {
            if let Err(e) = self.token.transfer(recipient, self.params.fee_recipient, fee) {
                *self = snapshot;
                return Err(e.into());
            }
        }
        self.flash_mint_active = false;
        Ok(fee)
    }

    /// Lend `amount` of system collateral to the callback; the host moves
    /// the actual asset. The callback must return principal + fee through
    /// [`repay_flash_borrow`] before returning. Returns the fee, which the
    /// host forwards to the fee recipient.
    ///
    /// While outstanding: withdrawals, liquidations, redemptions, and
    /// nested flash operations are rejected.
    pub fn flash_borrow(
        &mut self,
        caller: ActorId,
        amount: u128,
        data: &[u8],
        receiver: &mut dyn FlashLoanReceiver<T, R, O>,
    ) -> Result<u128> {
        if self.flash_mint_active {
            return Err(LedgerError::FlashMintInProgress);
        }
        if self.flash_borrow_outstanding > 0 {
            return Err(LedgerError::FlashBorrowInProgress);
        }
        if amount == 0 {
            return Err(LedgerError::ZeroAmount);
        }
        if amount > self.total_collateral {
            return Err(LedgerError::InsufficientCollateral);
        }
        let fee = wad_mul(amount, self.params.flash_borrow_fee_pct, Rounding::Up)?;
        let owed = add_u128(amount, fee)?;
        let snapshot = self.clone();
        self.total_collateral -= amount;
        self.flash_borrow_outstanding = owed;
        if !receiver.execute_operation(self, FlashAsset::Collateral, amount, fee, caller, data) {
            *self = snapshot;
            return Err(LedgerError::OperationFailed);
        }
        if self.flash_borrow_outstanding > 0 {
            let outstanding = self.flash_borrow_outstanding;
            *self = snapshot;
            return Err(LedgerError::FlashBorrowNotRepaid { outstanding });
        }
        // Repayment deposited principal + fee back; the fee leaves again
        // toward the fee recipient, host-side.
        self.total_collateral = sub_u128(self.total_collateral, fee)?;
        Ok(fee)
    }
}

