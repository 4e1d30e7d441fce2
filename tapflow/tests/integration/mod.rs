mod controller_test;
mod fastsync_test;
mod router_test;
mod store_test;
