use mall_proto::v1::{
    checkout_service_server::CheckoutService, ChargeReq, ChargeResp, CheckoutReq, CheckoutResp,
    GetCartReq, GetCartResp, GetProductReq, GetProductResp, OrderItem, PlaceOrderReq,
    PlaceOrderResp,
};
use mall_proxy::{Connector, ResilientProxy, ResponseCache};
use tonic::{Request, Response, Status};

use crate::convert::{context_from_metadata, fabric_to_status};

const ORDER_CURRENCY: &str = "CNY";

/// Checkout orchestration: read the cart, price it, place the order, charge
/// the card. Every hop goes through the proxy.
pub struct CheckoutServiceImpl<K: Connector, R> {
    proxy: ResilientProxy<K, R>,
}

impl<K: Connector, R: ResponseCache> CheckoutServiceImpl<K, R> {
    pub fn new(proxy: ResilientProxy<K, R>) -> Self {
        CheckoutServiceImpl { proxy }
    }
}

#[tonic::async_trait]
impl<K: Connector, R: ResponseCache> CheckoutService for CheckoutServiceImpl<K, R> {
    async fn checkout(
        &self,
        request: Request<CheckoutReq>,
    ) -> Result<Response<CheckoutResp>, Status> {
        let ctx = context_from_metadata(request.metadata());
        let req = request.into_inner();
        if req.user_id == 0 {
            return Err(Status::invalid_argument("user_id must not be zero"));
        }
        let Some(address) = req.address else {
            return Err(Status::invalid_argument("address is required"));
        };
        let Some(credit_card) = req.credit_card else {
            return Err(Status::invalid_argument("credit_card is required"));
        };

        let cart: GetCartResp = self
            .proxy
            .call(&ctx, "cart", "GetCart", &GetCartReq { user_id: req.user_id })
            .await
            .map_err(fabric_to_status)?;
        let items = cart.cart.map(|c| c.items).unwrap_or_default();
        if items.is_empty() {
            return Err(Status::failed_precondition("cart is empty"));
        }

        let mut order_items = Vec::with_capacity(items.len());
        for item in items {
            let product: GetProductResp = self
                .proxy
                .call(&ctx, "product", "GetProduct", &GetProductReq { id: item.product_id })
                .await
                .map_err(fabric_to_status)?;
            let price = product.product.map(|p| p.price).ok_or_else(|| {
                Status::failed_precondition(format!(
                    "product {} no longer exists",
                    item.product_id
                ))
            })?;
            order_items.push(OrderItem { cost: price * item.quantity as f32, item: Some(item) });
        }
        let amount: f32 = order_items.iter().map(|i| i.cost).sum();

        let placed: PlaceOrderResp = self
            .proxy
            .call(
                &ctx,
                "order",
                "PlaceOrder",
                &PlaceOrderReq {
                    user_id: req.user_id,
                    user_currency: ORDER_CURRENCY.to_string(),
                    address: Some(address),
                    email: req.email,
                    order_items,
                },
            )
            .await
            .map_err(fabric_to_status)?;
        let order_id = placed
            .order
            .map(|o| o.order_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Status::internal("order service returned no order id"))?;

        let charged: ChargeResp = self
            .proxy
            .call(
                &ctx,
                "payment",
                "Charge",
                &ChargeReq {
                    amount,
                    credit_card: Some(credit_card),
                    order_id: order_id.clone(),
                    user_id: req.user_id,
                },
            )
            .await
            .map_err(|e| {
                tracing::warn!(%order_id, error = %e, "charge failed after order was placed");
                fabric_to_status(e)
            })?;

        tracing::info!(
            user_id = req.user_id,
            %order_id,
            transaction_id = %charged.transaction_id,
            %amount,
            "checkout complete"
        );
        Ok(Response::new(CheckoutResp { order_id, transaction_id: charged.transaction_id }))
    }
}
