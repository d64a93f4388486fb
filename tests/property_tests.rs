use chrono::Utc;
use proptest::prelude::*;
use rust_decimal::Decimal;
use storefront_api::{entities::checkout_item, services::checkout::calculate_totals};
use uuid::Uuid;

fn item(unit_cents: i64, quantity: i32) -> checkout_item::Model {
    let unit_price = Decimal::new(unit_cents, 2);
    checkout_item::Model {
        id: Uuid::new_v4(),
        session_id: Uuid::nil(),
        product_id: Uuid::new_v4(),
        quantity,
        unit_price,
        subtotal: unit_price * Decimal::from(quantity),
        created_at: Utc::now(),
    }
}

fn lines() -> impl Strategy<Value = Vec<checkout_item::Model>> {
    prop::collection::vec((1i64..1_000_000, 1i32..20), 1..8)
        .prop_map(|raw| raw.into_iter().map(|(c, q)| item(c, q)).collect())
}

proptest! {
    #[test]
    fn final_is_total_minus_discount(items in lines(), pct in 0u32..=100) {
        let totals = calculate_totals(&items, Some(Decimal::from(pct)));
        prop_assert_eq!(totals.final_amount, totals.total_amount - totals.discount_amount);
        prop_assert!(totals.discount_amount >= Decimal::ZERO);
        prop_assert!(totals.discount_amount <= totals.total_amount);
        prop_assert!(totals.discount_amount.scale() <= 2);
    }

    #[test]
    fn total_is_sum_of_subtotals(items in lines()) {
        let totals = calculate_totals(&items, None);
        let expected: Decimal = items.iter().map(|i| i.subtotal).sum();
        prop_assert_eq!(totals.total_amount, expected);
        prop_assert_eq!(totals.discount_amount, Decimal::ZERO);
        prop_assert_eq!(totals.item_count, items.iter().map(|i| i.quantity).sum::<i32>());
    }

    #[test]
    fn bigger_discount_never_costs_more(items in lines(), a in 0u32..=100, b in 0u32..=100) {
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        let cheap = calculate_totals(&items, Some(Decimal::from(hi)));
        let dear = calculate_totals(&items, Some(Decimal::from(lo)));
        prop_assert!(cheap.final_amount <= dear.final_amount);
    }
}
