//! Maker/taker role resolution

use crate::core_types::{CustomerId, OrderId, Side};
use crate::trade::Counterparties;

/// One side of a prospective trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Party {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
}

/// Map (taker side, taker, maker) to buyer and seller.
pub fn resolve_roles(taker_side: Side, taker: Party, maker: Party) -> Counterparties {
    let (buy, sell) = match taker_side {
        Side::Buy => (taker, maker),
        Side::Sell => (maker, taker),
    };
    Counterparties {
        buy_order_id: buy.order_id,
        sell_order_id: sell.order_id,
        buyer_customer_id: buy.customer_id,
        seller_customer_id: sell.customer_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn party() -> Party {
        Party {
            order_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_buy_taker_is_buyer() {
        let (taker, maker) = (party(), party());
        let c = resolve_roles(Side::Buy, taker, maker);
        assert_eq!(c.buy_order_id, taker.order_id);
        assert_eq!(c.buyer_customer_id, taker.customer_id);
        assert_eq!(c.sell_order_id, maker.order_id);
        assert_eq!(c.seller_customer_id, maker.customer_id);
    }

    #[test]
    fn test_sell_taker_is_seller() {
        let (taker, maker) = (party(), party());
        let c = resolve_roles(Side::Sell, taker, maker);
        assert_eq!(c.sell_order_id, taker.order_id);
        assert_eq!(c.seller_customer_id, taker.customer_id);
        assert_eq!(c.buy_order_id, maker.order_id);
        assert_eq!(c.buyer_customer_id, maker.customer_id);
    }
}
