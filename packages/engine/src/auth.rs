//! Role hierarchy for job submission and inspection.
//!
//! Functions may declare `require-role` annotations; callers carry a single
//! role string. Dominance rules:
//!
//! - `service_role` and `dashboard_admin` dominate every role, custom ones
//!   included.
//! - `admin` dominates `authenticated` and `anon`.
//! - `authenticated` dominates `anon`.
//! - Custom roles count as `authenticated`-equivalent against the standard
//!   trio; a custom requirement needs an exact match.
//! - An empty requirement list permits all callers.

pub const SERVICE_ROLE: &str = "service_role";
pub const DASHBOARD_ADMIN: &str = "dashboard_admin";
pub const ADMIN: &str = "admin";
pub const AUTHENTICATED: &str = "authenticated";
pub const ANON: &str = "anon";

/// System sentinel recorded as `created_by` on scheduler-submitted jobs.
pub const SYSTEM_USER: &str = "system";

/// Whether `caller` satisfies a single required role.
pub fn role_satisfies(caller: &str, required: &str) -> bool {
    if caller == SERVICE_ROLE || caller == DASHBOARD_ADMIN {
        return true;
    }
    if caller == required {
        return true;
    }
    match required {
        // Every caller is at least anonymous.
        ANON => true,
        // admin and custom roles both clear the authenticated bar.
        AUTHENTICATED => caller != ANON,
        // admin is reachable only by exact match or the superroles above.
        ADMIN => false,
        // Custom requirements demand an exact match.
        _ => false,
    }
}

/// Whether `caller` satisfies any of the required roles.
///
/// An empty requirement list permits all callers.
pub fn satisfies_any(caller: &str, required: &[String]) -> bool {
    required.is_empty() || required.iter().any(|r| role_satisfies(caller, r))
}

/// Roles allowed to act on resources they do not own.
pub fn is_admin_tier(role: &str) -> bool {
    matches!(role, SERVICE_ROLE | DASHBOARD_ADMIN | ADMIN)
}
