/// Column-name constants and sentinel values for order-insight tables.
/// Single source of truth - shared by loaders, persistence and the Python bindings.

// ── Raw export columns (after header mapping) ───────────────────────────────
pub mod export {
    pub const ORDER_ID: &str = "order_id";
    pub const ORDER_TIME: &str = "order_time";
    pub const ORDER_VALUE: &str = "order_value";
    pub const ITEMS: &str = "items";
    pub const GOODS_TYPE: &str = "goods_type";
    pub const GOODS_NUM: &str = "goods_num";
    pub const USER_ID: &str = "user_id";
    pub const ADDRESS: &str = "address";
    pub const STATUS: &str = "status";

    pub const REQUIRED: [&str; 8] = [
        ORDER_ID,
        ORDER_TIME,
        ORDER_VALUE,
        ITEMS,
        GOODS_TYPE,
        GOODS_NUM,
        USER_ID,
        ADDRESS,
    ];

    /// Status values of orders that never completed.
    pub const CLOSED_STATUSES: [&str; 2] = ["交易关闭", "closed"];
}

// ── Persisted order columns ─────────────────────────────────────────────────
pub mod order {
    pub const ORDER_ID: &str = "order_id";
    pub const ORDER_TIME: &str = "order_time";
    pub const DT: &str = "dt";
    pub const MONTH: &str = "month";
    pub const DAY_OF_WEEK: &str = "day_of_week";
    pub const ORDER_VALUE: &str = "order_value";
    pub const GOODS_TYPE: &str = "goods_type";
    pub const GOODS_NUM: &str = "goods_num";
    pub const USER_ID: &str = "user_id";
    pub const ADDRESS: &str = "address";
    pub const ITEMS: &str = "items";
    pub const CATE_NUM: &str = "cate_num";
    pub const CHANNEL_NUM: &str = "channel_num";
    pub const PROVINCE: &str = "province";
    pub const CITY: &str = "city";
    pub const DISTRICT: &str = "district";
    pub const TIER: &str = "tier";
    pub const IS_CRM: &str = "is_crm";
    pub const PROMOTION: &str = "promotion";
    pub const PROMO_TYPE: &str = "promo_type";
    pub const NTH_ORDER: &str = "nth_order";
    pub const IS_REBUY: &str = "is_rebuy";
}

// ── Persisted order-line columns ────────────────────────────────────────────
pub mod line {
    pub const ORDER_ID: &str = "order_id";
    pub const PRODUCT_ID: &str = "product_id";
    pub const TITLE_ORIGIN: &str = "title_origin";
    pub const TITLE: &str = "title";
    pub const TITLE_REFINED: &str = "title_refined";
    pub const CHANNEL: &str = "channel";
    pub const CATEGORY: &str = "category";
    pub const PROMOTION: &str = "promotion";
    pub const PROMO_TYPE: &str = "promo_type";
}

// ── Per-buyer summary (derived, never persisted) ─────────────────────────────
pub mod buyer {
    pub const USER_ID: &str = "user_id";
    pub const IS_CRM: &str = "is_crm";
    pub const ORDERS: &str = "orders";
    pub const MONETARY: &str = "monetary";
    pub const LAST_DAY: &str = "last_day";
    pub const MAX_NTH: &str = "max_nth";
}

// ── Analysis-only columns ───────────────────────────────────────────────────
pub mod derived {
    /// Order date as a day number, for interval arithmetic.
    pub const DAY: &str = "day";
    /// Days since the buyer's previous order in the same group.
    pub const INTERVAL: &str = "interval";
    pub const FIRST_IN_GROUP: &str = "first_in_group";
    pub const HAS_NEXT: &str = "has_next";
    pub const BIN: &str = "bin";
}

// ── Reference tables ────────────────────────────────────────────────────────
pub mod catalog {
    pub const TITLE_CLEAN: &str = "title_clean";
    pub const TITLE_ORIGIN: &str = "title_origin";
    pub const PRODUCT_ID: &str = "product_id";
    pub const TITLE: &str = "title";
    pub const CHANNEL: &str = "channel";
    pub const CATEGORY: &str = "category";
    pub const TITLE_REFINED: &str = "title_refined";
}

pub mod crm {
    pub const USER_ID: &str = "user_id";
}

pub mod promo {
    pub const START_DATE: &str = "start_date";
    pub const END_DATE: &str = "end_date";
    pub const PROMOTION: &str = "promotion";
    pub const PROMO_TYPE: &str = "promo_type";
    pub const PRODUCT_ID: &str = "product_id";
}

pub mod region {
    pub const PROVINCE: &str = "province";
    pub const CITY: &str = "city";
    pub const DISTRICT: &str = "district";
    pub const TIER: &str = "tier";
}

// ── Sentinel values ─────────────────────────────────────────────────────────
pub mod sentinel {
    pub const CRM: &str = "CRM";
    pub const NON_CRM: &str = "non-CRM";
    pub const NO_PROMOTION: &str = "none";
    pub const ORDINARY_DAY: &str = "ordinary day";
}
