use axum::routing::MethodFilter;
use axum::Router;
use tonic::transport::Channel;

use mall_proto::v1::*;
use mall_proxy::{Connector, DispatchTable, ResilientProxy, ResponseCache};
use mall_types::FabricError;

use crate::gateway::{Gateway, GatewayConfig};

/// Every downstream method reachable through the proxy, keyed by the
/// service names used in configuration.
///
/// Only the catalog reads are cacheable; everything else either changes
/// state or returns per-user data that must be read fresh.
pub fn mall_dispatch_table() -> DispatchTable<Channel> {
    let mut t = DispatchTable::new();
    t.register_grpc::<DeliverTokenReq, DeliverTokenResp>(
        "auth",
        "DeliverToken",
        "/mall.v1.AuthService/DeliverToken",
    )
    .register_grpc::<VerifyTokenReq, VerifyTokenResp>(
        "auth",
        "VerifyToken",
        "/mall.v1.AuthService/VerifyToken",
    )
    .register_grpc::<TestGatewayMsgReq, TestGatewayMsgResp>(
        "auth",
        "TestGatewayMsg",
        "/mall.v1.AuthService/TestGatewayMsg",
    )
    .register_grpc::<RegisterReq, RegisterResp>("user", "Register", "/mall.v1.UserService/Register")
    .register_grpc::<LoginReq, LoginResp>("user", "Login", "/mall.v1.UserService/Login")
    .register_grpc::<ListProductsReq, ListProductsResp>(
        "product",
        "ListProducts",
        "/mall.v1.ProductCatalogService/ListProducts",
    )
    .register_grpc::<GetProductReq, GetProductResp>(
        "product",
        "GetProduct",
        "/mall.v1.ProductCatalogService/GetProduct",
    )
    .register_grpc::<SearchProductsReq, SearchProductsResp>(
        "product",
        "SearchProducts",
        "/mall.v1.ProductCatalogService/SearchProducts",
    )
    .register_grpc::<AddItemReq, AddItemResp>("cart", "AddItem", "/mall.v1.CartService/AddItem")
    .register_grpc::<GetCartReq, GetCartResp>("cart", "GetCart", "/mall.v1.CartService/GetCart")
    .register_grpc::<EmptyCartReq, EmptyCartResp>(
        "cart",
        "EmptyCart",
        "/mall.v1.CartService/EmptyCart",
    )
    .register_grpc::<PlaceOrderReq, PlaceOrderResp>(
        "order",
        "PlaceOrder",
        "/mall.v1.OrderService/PlaceOrder",
    )
    .register_grpc::<ListOrderReq, ListOrderResp>(
        "order",
        "ListOrder",
        "/mall.v1.OrderService/ListOrder",
    )
    .register_grpc::<MarkOrderPaidReq, MarkOrderPaidResp>(
        "order",
        "MarkOrderPaid",
        "/mall.v1.OrderService/MarkOrderPaid",
    )
    .register_grpc::<ChargeReq, ChargeResp>("payment", "Charge", "/mall.v1.PaymentService/Charge")
    .register_grpc::<CheckoutReq, CheckoutResp>(
        "checkout",
        "Checkout",
        "/mall.v1.CheckoutService/Checkout",
    )
    .mark_cacheable("product", "ListProducts")
    .mark_cacheable("product", "GetProduct")
    .mark_cacheable("product", "SearchProducts");
    t
}

/// The public HTTP surface. Fails if a route names a method missing from the
/// proxy's dispatch table.
///
/// Only `/product/get` is a cached route; every other route calls through
/// to its service on each request.
pub fn gateway_router<K, R>(
    proxy: ResilientProxy<K, R>,
    config: GatewayConfig,
) -> Result<Router, FabricError>
where
    K: Connector,
    R: ResponseCache,
{
    use MethodFilter as M;

    let router = Gateway::new(proxy, config)
        .route::<TestGatewayMsgReq, TestGatewayMsgResp>(
            M::GET,
            "/test_auth",
            "auth",
            "TestGatewayMsg",
        )?
        .route::<LoginReq, LoginResp>(M::POST, "/login", "user", "Login")?
        .route::<RegisterReq, RegisterResp>(M::POST, "/register", "user", "Register")?
        .route::<ListProductsReq, ListProductsResp>(M::GET, "/product", "product", "ListProducts")?
        .cached_route::<GetProductReq, GetProductResp>(
            M::GET,
            "/product/get",
            "product",
            "GetProduct",
        )?
        .route::<SearchProductsReq, SearchProductsResp>(
            M::POST,
            "/product/search",
            "product",
            "SearchProducts",
        )?
        .route::<AddItemReq, AddItemResp>(M::POST, "/cart/add", "cart", "AddItem")?
        .route::<GetCartReq, GetCartResp>(M::GET, "/cart/get", "cart", "GetCart")?
        .route::<EmptyCartReq, EmptyCartResp>(M::DELETE, "/cart/empty", "cart", "EmptyCart")?
        .route::<PlaceOrderReq, PlaceOrderResp>(M::POST, "/order/place", "order", "PlaceOrder")?
        .route::<ListOrderReq, ListOrderResp>(M::GET, "/order/list", "order", "ListOrder")?
        .route::<MarkOrderPaidReq, MarkOrderPaidResp>(
            M::POST,
            "/order/mark_paid",
            "order",
            "MarkOrderPaid",
        )?
        .route::<ChargeReq, ChargeResp>(M::POST, "/payment/charge", "payment", "Charge")?
        .route::<CheckoutReq, CheckoutResp>(M::POST, "/checkout", "checkout", "Checkout")?
        .into_router();
    Ok(router)
}

#[cfg(test)]
mod tests {
    use mall_types::MethodDescriptor;

    use super::*;

    #[test]
    fn table_covers_every_service() {
        let table = mall_dispatch_table();
        assert_eq!(table.len(), 16);
        for (service, method) in [
            ("auth", "VerifyToken"),
            ("user", "Login"),
            ("product", "GetProduct"),
            ("cart", "GetCart"),
            ("order", "PlaceOrder"),
            ("payment", "Charge"),
            ("checkout", "Checkout"),
        ] {
            assert!(table.contains(&MethodDescriptor::new(service, method)), "{service}.{method}");
        }
        let place_order = MethodDescriptor::new("order", "PlaceOrder");
        table.contract::<PlaceOrderReq, PlaceOrderResp>(&place_order).unwrap();
    }

    #[test]
    fn only_catalog_reads_are_cacheable() {
        let table = mall_dispatch_table();
        let mut cacheable: Vec<String> = table
            .descriptors()
            .filter(|desc| table.is_cacheable(desc))
            .map(ToString::to_string)
            .collect();
        cacheable.sort();
        assert_eq!(
            cacheable,
            vec!["product.GetProduct", "product.ListProducts", "product.SearchProducts"]
        );
    }
}
