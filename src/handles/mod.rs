pub mod accounts;

use crate::core::Registry;

pub fn register_all(reg: &mut Registry) {
    accounts::register(reg);
}
