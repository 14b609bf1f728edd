//! Order repository. After submission the reconciler (and the broker
//! callback path feeding it) is the only writer.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::Db;
use crate::models::{OrderRecord, OrderSide, OrderState, TimeInForce};

fn order_from_row(row: &Row) -> rusqlite::Result<OrderRecord> {
    let side: String = row.get("side")?;
    let tif: String = row.get("tif")?;
    let state: String = row.get("state")?;
    let created_at: String = row.get("created_at")?;
    Ok(OrderRecord {
        id: row.get("id")?,
        broker_order_id: row.get("broker_order_id")?,
        parent_broker_order_id: row.get("parent_broker_order_id")?,
        trade_id: row.get("trade_id")?,
        symbol: row.get("symbol")?,
        side: OrderSide::parse(&side).unwrap_or(OrderSide::Buy),
        quantity: row.get("quantity")?,
        limit_price: row.get("limit_price")?,
        order_type: row.get("order_type")?,
        tif: TimeInForce::parse(&tif).unwrap_or(TimeInForce::Day),
        state: OrderState::parse(&state).unwrap_or(OrderState::Working),
        filled_quantity: row.get("filled_quantity")?,
        avg_fill_price: row.get("avg_fill_price")?,
        commission: row.get("commission")?,
        last_broker_status: row.get("last_broker_status")?,
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_default(),
    })
}

const ORDER_COLS: &str = "id, broker_order_id, parent_broker_order_id, trade_id, symbol, side, \
     quantity, limit_price, order_type, tif, state, filled_quantity, avg_fill_price, commission, \
     last_broker_status, created_at";

impl Db {
    pub fn insert_order(&self, order: &OrderRecord) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO orders (broker_order_id, parent_broker_order_id, trade_id, symbol, \
             side, quantity, limit_price, order_type, tif, state, filled_quantity, \
             avg_fill_price, commission, last_broker_status, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                order.broker_order_id,
                order.parent_broker_order_id,
                order.trade_id,
                order.symbol,
                order.side.as_str(),
                order.quantity,
                order.limit_price,
                order.order_type,
                order.tif.as_str(),
                order.state.as_str(),
                order.filled_quantity,
                order.avg_fill_price,
                order.commission,
                order.last_broker_status,
                order.created_at.to_rfc3339(),
            ],
        )
        .context("insert order")?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_order_by_broker_id(&self, broker_order_id: &str) -> Result<Option<OrderRecord>> {
        let conn = self.lock();
        conn.query_row(
            &format!("SELECT {ORDER_COLS} FROM orders WHERE broker_order_id = ?1"),
            params![broker_order_id],
            order_from_row,
        )
        .optional()
        .context("get order by broker id")
    }

    pub fn orders_for_trade(&self, trade_id: i64) -> Result<Vec<OrderRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ORDER_COLS} FROM orders WHERE trade_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![trade_id], order_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("orders for trade")
    }

    pub fn working_orders(&self) -> Result<Vec<OrderRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ORDER_COLS} FROM orders \
             WHERE state IN ('working', 'partially_filled') ORDER BY id"
        ))?;
        let rows = stmt.query_map([], order_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("working orders")
    }

    pub fn children_of(&self, parent_broker_order_id: &str) -> Result<Vec<OrderRecord>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ORDER_COLS} FROM orders WHERE parent_broker_order_id = ?1 ORDER BY id"
        ))?;
        let rows = stmt.query_map(params![parent_broker_order_id], order_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .context("children of order")
    }

    /// Broker-truth update applied by the reconciler or the fill path.
    pub fn update_order_from_broker(
        &self,
        broker_order_id: &str,
        state: OrderState,
        filled_quantity: i64,
        avg_fill_price: Option<f64>,
        last_broker_status: &str,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE orders SET state = ?2, filled_quantity = ?3, avg_fill_price = ?4, \
             last_broker_status = ?5 WHERE broker_order_id = ?1",
            params![
                broker_order_id,
                state.as_str(),
                filled_quantity,
                avg_fill_price,
                last_broker_status,
            ],
        )?;
        Ok(())
    }

    pub fn set_order_commission(&self, broker_order_id: &str, commission: f64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE orders SET commission = ?2 WHERE broker_order_id = ?1",
            params![broker_order_id, commission],
        )?;
        Ok(())
    }

    pub fn update_order_limit(&self, broker_order_id: &str, limit_price: f64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE orders SET limit_price = ?2 WHERE broker_order_id = ?1",
            params![broker_order_id, limit_price],
        )?;
        Ok(())
    }

    /// The reconciler links orphan orders to trades discovered post-hoc.
    pub fn link_order_to_trade(&self, broker_order_id: &str, trade_id: i64) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE orders SET trade_id = ?2 WHERE broker_order_id = ?1",
            params![broker_order_id, trade_id],
        )?;
        Ok(())
    }

    pub fn record_discrepancy(
        &self,
        kind: &str,
        broker_order_id: Option<&str>,
        trade_id: Option<i64>,
        detail: &str,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO discrepancies (kind, broker_order_id, trade_id, detail, recorded_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![kind, broker_order_id, trade_id, detail, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn discrepancy_count(&self, kind: &str) -> Result<i64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM discrepancies WHERE kind = ?1",
            params![kind],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_order(broker_id: &str, parent: Option<&str>) -> OrderRecord {
        OrderRecord {
            id: 0,
            broker_order_id: broker_id.to_string(),
            parent_broker_order_id: parent.map(|s| s.to_string()),
            trade_id: None,
            symbol: "XSP".into(),
            side: OrderSide::Sell,
            quantity: 3,
            limit_price: 1.80,
            order_type: "LMT".into(),
            tif: TimeInForce::Day,
            state: OrderState::Working,
            filled_quantity: 0,
            avg_fill_price: None,
            commission: 0.0,
            last_broker_status: "Submitted".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn bracket_parent_child_linkage() {
        let db = Db::open_in_memory().unwrap();
        db.insert_order(&sample_order("100", None)).unwrap();
        db.insert_order(&sample_order("101", Some("100"))).unwrap();
        db.insert_order(&sample_order("102", Some("100"))).unwrap();

        let children = db.children_of("100").unwrap();
        assert_eq!(children.len(), 2);
        assert!(children
            .iter()
            .all(|c| c.parent_broker_order_id.as_deref() == Some("100")));
    }

    #[test]
    fn broker_update_and_fill() {
        let db = Db::open_in_memory().unwrap();
        db.insert_order(&sample_order("200", None)).unwrap();

        db.update_order_from_broker("200", OrderState::PartiallyFilled, 2, Some(1.79), "Submitted")
            .unwrap();
        let order = db.get_order_by_broker_id("200").unwrap().unwrap();
        assert_eq!(order.state, OrderState::PartiallyFilled);
        assert_eq!(order.filled_quantity, 2);

        db.update_order_from_broker("200", OrderState::Filled, 3, Some(1.79), "Filled")
            .unwrap();
        let order = db.get_order_by_broker_id("200").unwrap().unwrap();
        assert!(order.state.is_terminal());
        assert!(db.working_orders().unwrap().is_empty());
    }
}
