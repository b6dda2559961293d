// Typed predicates and sort keys over the request listing
//
// Every column reference resolves through `Field`, so the SQL text produced
// here only ever contains fixed fragments and `?N` placeholders.

use crate::record::Literal;

/// Column (or computed expression) of the joined request listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    RequestId,
    Description,
    ShopId,
    ShopName,
    WorkCategoryId,
    WorkCategoryName,
    UrgencyId,
    UrgencyName,
    ContractorId,
    ContractorName,
    Status,
    CreatedAt,
    IsOverdue,
    /// created_at plus the resolved day count, in milliseconds
    Deadline,
}

impl Field {
    pub(crate) fn to_sql(self) -> &'static str {
        match self {
            Field::RequestId => "r.id",
            Field::Description => "r.description",
            Field::ShopId => "r.shop_id",
            Field::ShopName => "s.name",
            Field::WorkCategoryId => "r.work_category_id",
            Field::WorkCategoryName => "wc.name",
            Field::UrgencyId => "r.urgency_id",
            Field::UrgencyName => "uc.name",
            Field::ContractorId => "r.assigned_contractor_id",
            Field::ContractorName => "cu.login",
            Field::Status => "r.status",
            Field::CreatedAt => "r.created_at",
            Field::IsOverdue => "r.is_overdue",
            Field::Deadline => {
                "(r.created_at + (CASE WHEN LOWER(uc.name) = 'customizable' AND rcd.days IS NOT NULL \
                 THEN rcd.days ELSE uc.default_days END) * 86400000)"
            }
        }
    }

    /// Whitelisted sort keys accepted from callers
    pub fn from_sort_key(key: &str) -> Option<Field> {
        match key {
            "requestID" | "requestId" | "id" => Some(Field::RequestId),
            "description" => Some(Field::Description),
            "shopName" => Some(Field::ShopName),
            "workCategoryName" => Some(Field::WorkCategoryName),
            "urgencyName" => Some(Field::UrgencyName),
            "assignedContractorName" => Some(Field::ContractorName),
            "status" => Some(Field::Status),
            "createdAt" => Some(Field::CreatedAt),
            "daysRemaining" | "deadline" => Some(Field::Deadline),
            _ => None,
        }
    }
}

/// Single comparison `field op value`
#[derive(Debug, Clone)]
pub struct Filter {
    /// Field to filter on
    pub field: Field,
    /// Comparison operator
    pub op: FilterOp,
    /// Value to compare against
    pub value: Literal,
}

/// Comparison operators for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,       // ==
    Ne,       // !=
    Gt,       // >
    Lt,       // <
    Gte,      // >=
    Lte,      // <=
    Contains, // case-insensitive substring
}

impl FilterOp {
    pub(crate) fn to_sql(self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "!=",
            FilterOp::Gt => ">",
            FilterOp::Lt => "<",
            FilterOp::Gte => ">=",
            FilterOp::Lte => "<=",
            FilterOp::Contains => "CONTAINS",
        }
    }
}

impl std::fmt::Display for FilterOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_sql())
    }
}

/// Predicate tree rendered into a WHERE clause
#[derive(Debug, Clone)]
pub enum Expr {
    /// Matches every row
    True,
    /// Matches no row
    False,
    Compare(Filter),
    /// `field IN (values)`; an empty list matches nothing
    In { field: Field, values: Vec<Literal> },
    And(Vec<Expr>),
}

impl Expr {
    pub fn eq(field: Field, value: impl Into<Literal>) -> Self {
        Expr::Compare(Filter {
            field,
            op: FilterOp::Eq,
            value: value.into(),
        })
    }

    pub fn contains(field: Field, needle: &str) -> Self {
        Expr::Compare(Filter {
            field,
            op: FilterOp::Contains,
            value: Literal::Text(needle.to_string()),
        })
    }

    pub fn is_in<V: Into<Literal>>(field: Field, values: impl IntoIterator<Item = V>) -> Self {
        Expr::In {
            field,
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// AND-combines `parts`, flattening nested conjunctions and dropping `True`
    pub fn all(parts: impl IntoIterator<Item = Expr>) -> Self {
        let mut flat = Vec::new();
        for part in parts {
            match part {
                Expr::True => {}
                Expr::And(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Expr::True,
            1 => flat.remove(0),
            _ => Expr::And(flat),
        }
    }

    /// Renders the predicate, appending bound values to `params`.
    /// Placeholders are numbered after whatever `params` already holds.
    pub fn to_sql(&self, params: &mut Vec<Literal>) -> String {
        match self {
            Expr::True => "1 = 1".to_string(),
            Expr::False => "1 = 0".to_string(),
            Expr::Compare(filter) => {
                let column = filter.field.to_sql();
                match filter.op {
                    FilterOp::Contains => {
                        let needle = match &filter.value {
                            Literal::Text(s) => s.to_lowercase(),
                            other => other.to_string(),
                        };
                        params.push(Literal::Text(needle));
                        format!("instr(casefold({}), ?{}) > 0", column, params.len())
                    }
                    op => {
                        params.push(filter.value.clone());
                        format!("{} {} ?{}", column, op.to_sql(), params.len())
                    }
                }
            }
            Expr::In { field, values } => {
                if values.is_empty() {
                    return "1 = 0".to_string();
                }
                let placeholders: Vec<String> = values
                    .iter()
                    .map(|value| {
                        params.push(value.clone());
                        format!("?{}", params.len())
                    })
                    .collect();
                format!("{} IN ({})", field.to_sql(), placeholders.join(", "))
            }
            Expr::And(parts) => {
                let rendered: Vec<String> = parts.iter().map(|p| format!("({})", p.to_sql(params))).collect();
                rendered.join(" AND ")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

/// One `(field, direction)` pair of an ORDER BY
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub field: Field,
    pub direction: Direction,
}

impl SortKey {
    pub fn default_order() -> Self {
        Self {
            field: Field::RequestId,
            direction: Direction::Desc,
        }
    }

    /// Parses `field[,direction]`; fields outside the whitelist yield `None`
    pub fn parse(param: &str) -> Option<Self> {
        let mut parts = param.split(',').map(str::trim);
        let field = Field::from_sort_key(parts.next()?)?;
        let direction = match parts.next() {
            Some(d) if d.eq_ignore_ascii_case("desc") => Direction::Desc,
            _ => Direction::Asc,
        };
        Some(Self { field, direction })
    }

    /// Resolves caller sort params, silently dropping unknown fields.
    /// Falls back to request id descending when nothing resolves.
    pub fn resolve(params: &[String]) -> Vec<SortKey> {
        let keys: Vec<SortKey> = params.iter().filter_map(|p| SortKey::parse(p)).collect();
        if keys.is_empty() { vec![SortKey::default_order()] } else { keys }
    }
}

/// ORDER BY clause for `keys`; request id is appended as the final tiebreaker
/// so pagination stays stable
pub fn order_by_sql(keys: &[SortKey]) -> String {
    let mut parts: Vec<String> = keys
        .iter()
        .map(|k| {
            let dir = match k.direction {
                Direction::Asc => "ASC",
                Direction::Desc => "DESC",
            };
            format!("{} {}", k.field.to_sql(), dir)
        })
        .collect();
    if !keys.iter().any(|k| k.field == Field::RequestId) {
        parts.push("r.id DESC".to_string());
    }
    format!(" ORDER BY {}", parts.join(", "))
}
