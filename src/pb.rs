//! Generated wire types and service stubs for `hydris.v1`.

tonic::include_proto!("hydris.v1");
