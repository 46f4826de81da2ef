mod jsonrpc_worker;
mod snapshot;
