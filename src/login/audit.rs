//! Audit text describing who a reconciliation cycle authorized

use crate::policy::LoginUser;

/// Human-readable summary of one reconciliation cycle
///
/// `superusers` is expected to be a subset of `authorized_users`.
pub fn describe_policy(
    authorized_users: &[LoginUser],
    superusers: &[LoginUser],
    missing_users: &[LoginUser],
) -> String {
    let total = authorized_users.len();
    let privileged = superusers.len();
    let normal = total.saturating_sub(privileged);

    let mut description = format!(
        "{} authorized users ({} normal, {} superuser).\n",
        total, normal, privileged
    );

    for user in missing_users {
        description.push_str(&format!("Public key missing for {}.\n", user.username));
    }

    description
}
