pub mod v1 {
    tonic::include_proto!("mall.v1");
}

pub const FILE_DESCRIPTOR_SET: &[u8] = tonic::include_file_descriptor_set!("descriptor");

#[cfg(test)]
mod tests {
    use super::v1::{Address, CartItem, OrderItem, PlaceOrderReq};

    #[test]
    fn place_order_binds_from_partial_json() {
        let json = r#"{
            "user_id": 7,
            "email": "a@b.c",
            "order_items": [{"item": {"product_id": 3, "quantity": 2}, "cost": 200.0}]
        }"#;
        let req: PlaceOrderReq = serde_json::from_str(json).unwrap();
        assert_eq!(req.user_id, 7);
        assert!(req.user_currency.is_empty());
        assert!(req.address.is_none());
        assert_eq!(
            req.order_items,
            vec![OrderItem { item: Some(CartItem { product_id: 3, quantity: 2 }), cost: 200.0 }]
        );
    }

    #[test]
    fn address_serializes_field_names_verbatim() {
        let json = serde_json::to_value(Address {
            city: "Hangzhou".into(),
            zip_code: "310000".into(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(json["city"], "Hangzhou");
        assert_eq!(json["zip_code"], "310000");
    }
}
