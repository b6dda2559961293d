// Role-scoped visibility of requests

use crate::filter::{Expr, Field};
use crate::models::{Role, User};
use crate::store::Store;
use eyre::Result;

/// Identity of whoever invokes an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: i64,
    /// `None` when the stored role name maps to no known role
    pub role: Option<Role>,
}

impl Caller {
    pub fn new(user_id: i64, role: Role) -> Self {
        Self {
            user_id,
            role: Some(role),
        }
    }

    pub fn from_user(user: &User) -> Self {
        Self {
            user_id: user.id,
            role: user.role(),
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Some(Role::RetailAdmin)
    }
}

/// Forced predicate for a caller, one variant per role
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessScope {
    /// Admins see everything; shop and contractor filters are theirs to choose
    Unrestricted {
        shop_id: Option<i64>,
        contractor_id: Option<i64>,
    },
    AssignedTo(i64),
    Shops(Vec<i64>),
    /// Fail closed
    Nothing,
}

impl AccessScope {
    /// Resolves the scope for `caller`; the shop/contractor filters only
    /// survive for admins
    pub fn for_caller(
        store: &Store,
        caller: &Caller,
        shop_id: Option<i64>,
        contractor_id: Option<i64>,
    ) -> Result<Self> {
        let scope = match caller.role {
            Some(Role::RetailAdmin) => AccessScope::Unrestricted { shop_id, contractor_id },
            Some(Role::Contractor) => AccessScope::AssignedTo(caller.user_id),
            Some(Role::StoreManager) => AccessScope::Shops(store.shops_managed_by(caller.user_id)?),
            None => AccessScope::Nothing,
        };
        Ok(scope)
    }

    /// True when no request can possibly be visible
    pub fn is_empty(&self) -> bool {
        match self {
            AccessScope::Shops(shops) => shops.is_empty(),
            AccessScope::Nothing => true,
            _ => false,
        }
    }

    pub fn predicate(&self) -> Expr {
        match self {
            AccessScope::Unrestricted { shop_id, contractor_id } => Expr::all([
                shop_id.map_or(Expr::True, |id| Expr::eq(Field::ShopId, id)),
                contractor_id.map_or(Expr::True, |id| Expr::eq(Field::ContractorId, id)),
            ]),
            AccessScope::AssignedTo(user_id) => Expr::eq(Field::ContractorId, *user_id),
            AccessScope::Shops(shops) => Expr::is_in(Field::ShopId, shops.iter().copied()),
            AccessScope::Nothing => Expr::False,
        }
    }

    /// Whether a single request falls inside this scope
    pub fn admits(&self, shop_id: i64, contractor_id: Option<i64>) -> bool {
        match self {
            AccessScope::Unrestricted { .. } => true,
            AccessScope::AssignedTo(user_id) => contractor_id == Some(*user_id),
            AccessScope::Shops(shops) => shops.contains(&shop_id),
            AccessScope::Nothing => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn render(scope: &AccessScope) -> String {
        let mut params = Vec::new();
        scope.predicate().to_sql(&mut params)
    }

    #[test]
    fn test_contractor_filters_are_ignored() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path()).unwrap();
        let caller = Caller::new(7, Role::Contractor);

        let scope = AccessScope::for_caller(&store, &caller, Some(1), Some(99)).unwrap();
        assert_eq!(scope, AccessScope::AssignedTo(7));
        assert_eq!(render(&scope), "r.assigned_contractor_id = ?1");
    }

    #[test]
    fn test_admin_keeps_optional_filters() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path()).unwrap();
        let caller = Caller::new(1, Role::RetailAdmin);

        let scope = AccessScope::for_caller(&store, &caller, None, None).unwrap();
        assert_eq!(render(&scope), "1 = 1");

        let scope = AccessScope::for_caller(&store, &caller, Some(3), Some(4)).unwrap();
        assert_eq!(render(&scope), "(r.shop_id = ?1) AND (r.assigned_contractor_id = ?2)");
    }

    #[test]
    fn test_manager_without_shops_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path()).unwrap();
        let manager = store.insert_user("boss", Role::StoreManager).unwrap();

        let scope = AccessScope::for_caller(&store, &Caller::new(manager, Role::StoreManager), None, None).unwrap();
        assert!(scope.is_empty());

        let shop = store.insert_shop("North", Some(manager)).unwrap();
        let scope = AccessScope::for_caller(&store, &Caller::new(manager, Role::StoreManager), None, None).unwrap();
        assert_eq!(scope, AccessScope::Shops(vec![shop]));
        assert!(!scope.is_empty());
    }

    #[test]
    fn test_unknown_role_sees_nothing() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path()).unwrap();
        let caller = Caller {
            user_id: 5,
            role: None,
        };

        let scope = AccessScope::for_caller(&store, &caller, None, None).unwrap();
        assert!(scope.is_empty());
        assert_eq!(render(&scope), "1 = 0");
        assert!(!scope.admits(1, Some(5)));
    }

    #[test]
    fn test_admits() {
        assert!(AccessScope::AssignedTo(2).admits(1, Some(2)));
        assert!(!AccessScope::AssignedTo(2).admits(1, None));
        assert!(AccessScope::Shops(vec![1, 3]).admits(3, None));
        assert!(!AccessScope::Shops(vec![1, 3]).admits(2, None));
    }
}
