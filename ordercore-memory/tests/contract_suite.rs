use ordercore_testing::contract::order_store_contract_tests;

order_store_contract_tests! {
    suite = in_memory_contract,
    make_store = ::ordercore_memory::InMemoryOrderStore::new,
}
