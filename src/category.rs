use crate::model::{CandidateTransaction, Category};

const VOCABULARY: &[(Category, &[&str])] = &[
    (Category::Food, &["FOOD", "RESTAURANT", "GROCERY", "CAFE", "DINNER"]),
    (Category::Transport, &["UBER", "OLA", "METRO", "FUEL", "PETROL", "TRAVEL"]),
    (Category::Utilities, &["BILL", "ELECTRICITY", "RECHARGE", "WIFI", "POWER"]),
    (Category::Entertainment, &["MOVIE", "NETFLIX", "GAME", "ENTERTAINMENT"]),
    (Category::Health, &["PHARMACY", "DOCTOR", "HOSPITAL", "MEDICINE"]),
    (Category::Transfer, &["TRANSFER", "SEND", "P2P"]),
];

fn match_keywords(hint: &str) -> Option<Category> {
    let upper = hint.to_uppercase();
    VOCABULARY
        .iter()
        .find(|(_, words)| words.iter().any(|w| upper.contains(w)))
        .map(|(category, _)| *category)
}

/// Keyword match over invoice reference, then merchant id, then receiver id.
/// Without a match: TRANSFER for plain person-to-person payments, else OTHER.
pub fn categorize(tx: &CandidateTransaction) -> Category {
    let hints = [
        tx.invoice_id.as_deref(),
        tx.merchant_id.as_deref(),
        Some(tx.receiver_id.as_str()),
    ];
    if let Some(category) = hints.iter().flatten().find_map(|h| match_keywords(h)) {
        return category;
    }
    let has_merchant = tx.merchant_id.as_deref().map_or(false, |m| !m.trim().is_empty());
    if !has_merchant && !tx.receiver_id.trim().is_empty() {
        Category::Transfer
    } else {
        Category::Other
    }
}
